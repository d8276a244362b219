//! Embedded linkage and record addressing.
//!
//! A record indexed by a [`NodeTable`](super::NodeTable) carries one
//! [`IndexLink`] per table it belongs to. The table never owns records: it
//! reaches them through an [`Addressing`] store and finds the right link inside
//! each record through a [`LinkField`].

use std::fmt;

/// Tree linkage embedded in an indexed record.
///
/// `height` is zero while the record is not linked into any table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLink<I> {
    pub parent: Option<I>,
    pub left: Option<I>,
    pub right: Option<I>,
    pub height: u32,
}

impl<I> IndexLink<I> {
    /// A link that is not part of any table.
    pub const fn unlinked() -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            height: 0,
        }
    }

    /// Whether the owning record is currently linked into a table.
    pub fn is_linked(&self) -> bool {
        self.height != 0
    }
}

impl<I> Default for IndexLink<I> {
    fn default() -> Self {
        Self::unlinked()
    }
}

/// Locates one embedded link inside a record.
///
/// A record that sits in several tables has several links; each table is
/// constructed with the field that belongs to it.
pub struct LinkField<R, L> {
    get: fn(&R) -> &L,
    get_mut: fn(&mut R) -> &mut L,
}

impl<R, L> LinkField<R, L> {
    pub const fn new(get: fn(&R) -> &L, get_mut: fn(&mut R) -> &mut L) -> Self {
        Self { get, get_mut }
    }

    #[inline]
    pub fn of<'r>(&self, record: &'r R) -> &'r L {
        (self.get)(record)
    }

    #[inline]
    pub fn of_mut<'r>(&self, record: &'r mut R) -> &'r mut L {
        (self.get_mut)(record)
    }
}

impl<R, L> Clone for LinkField<R, L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R, L> Copy for LinkField<R, L> {}

impl<R, L> fmt::Debug for LinkField<R, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkField").finish_non_exhaustive()
    }
}

/// Maps record identities to records.
///
/// Two addressing modes ship with the crate: a flat region (`[R]`, identity is
/// the offset from the start of the region) and the slot [`Arena`](super::Arena)
/// (identity is a [`SlotId`](super::SlotId) into heap storage). Indexing an
/// identity that does not name a live record is a caller bug and panics.
pub trait Addressing {
    type Record;
    type Id: Copy + Eq + fmt::Debug;

    fn record(&self, id: Self::Id) -> &Self::Record;

    fn record_mut(&mut self, id: Self::Id) -> &mut Self::Record;
}

impl<R> Addressing for [R] {
    type Record = R;
    type Id = usize;

    #[inline]
    fn record(&self, id: usize) -> &R {
        &self[id]
    }

    #[inline]
    fn record_mut(&mut self, id: usize) -> &mut R {
        &mut self[id]
    }
}
