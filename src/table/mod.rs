//! Allocation-free intrusive index structures.
//!
//! - [`link`]: embedded linkage and the [`Addressing`] abstraction
//! - [`arena`]: slot arena addressing for heap-stored records
//! - [`avl`]: [`NodeTable`], the intrusive AVL tree
//! - [`list`]: [`IntrusiveList`], the intrusive doubly-linked list

pub mod arena;
pub mod avl;
pub mod link;
pub mod list;

pub use arena::{Arena, ArenaError, SlotId};
pub use avl::NodeTable;
pub use link::{Addressing, IndexLink, LinkField};
pub use list::{IntrusiveList, ListLink};
