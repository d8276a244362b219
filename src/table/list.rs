//! Intrusive doubly-linked list.
//!
//! Same shape as [`NodeTable`](super::NodeTable): the list holds only the head,
//! the tail and a length; `prev`/`next` live inside each record.

use std::fmt;

use super::link::{Addressing, LinkField};

/// List linkage embedded in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListLink<I> {
    pub prev: Option<I>,
    pub next: Option<I>,
}

impl<I> ListLink<I> {
    pub const fn unlinked() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

impl<I> Default for ListLink<I> {
    fn default() -> Self {
        Self::unlinked()
    }
}

/// Most-recent-first list. The head is the most recently pushed record.
pub struct IntrusiveList<R, I> {
    head: Option<I>,
    tail: Option<I>,
    len: usize,
    field: LinkField<R, ListLink<I>>,
}

impl<R, I: fmt::Debug> fmt::Debug for IntrusiveList<R, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntrusiveList")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

impl<R, I> IntrusiveList<R, I>
where
    I: Copy + Eq + fmt::Debug,
{
    pub fn new(field: LinkField<R, ListLink<I>>) -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            field,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<I> {
        self.head
    }

    pub fn tail(&self) -> Option<I> {
        self.tail
    }

    pub fn next<S>(&self, store: &S, id: I) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.field.of(store.record(id)).next
    }

    pub fn prev<S>(&self, store: &S, id: I) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.field.of(store.record(id)).prev
    }

    /// Link an unlinked record at the head.
    pub fn push_front<S>(&mut self, store: &mut S, id: I)
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let old_head = self.head;
        *self.field.of_mut(store.record_mut(id)) = ListLink {
            prev: None,
            next: old_head,
        };
        match old_head {
            Some(head) => self.field.of_mut(store.record_mut(head)).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
        self.len += 1;
    }

    /// Unlink a record that is currently in the list.
    pub fn unlink<S>(&mut self, store: &mut S, id: I)
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let ListLink { prev, next } = *self.field.of(store.record(id));
        match prev {
            Some(prev) => self.field.of_mut(store.record_mut(prev)).next = next,
            None => {
                debug_assert_eq!(self.head, Some(id), "unlink() of record {id:?} not in list");
                self.head = next;
            }
        }
        match next {
            Some(next) => self.field.of_mut(store.record_mut(next)).prev = prev,
            None => self.tail = prev,
        }
        *self.field.of_mut(store.record_mut(id)) = ListLink::unlinked();
        self.len -= 1;
    }

    pub fn move_to_front<S>(&mut self, store: &mut S, id: I)
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        if self.head == Some(id) {
            return;
        }
        self.unlink(store, id);
        self.push_front(store, id);
    }

    /// Head-to-tail iteration.
    pub fn iter<'a, S>(&'a self, store: &'a S) -> impl Iterator<Item = I> + 'a
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.next(store, id);
            Some(id)
        })
    }
}
