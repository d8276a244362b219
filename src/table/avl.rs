//! Intrusive AVL tree.
//!
//! The table keeps only a root identity, a count, the link field it threads
//! through and the comparator. Records, and the links embedded in them, live
//! in whatever [`Addressing`] store the caller passes to each operation, so
//! no operation here allocates.
//!
//! The table is not synchronized; whoever owns the store serializes access.

use std::cmp::Ordering;
use std::fmt;

use tracing::debug;

use super::link::{Addressing, IndexLink, LinkField};

/// Deeper than any balanced tree addressable with 64-bit identities.
const MAX_VERIFY_DEPTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retrace {
    /// A single rotation (or an unchanged height) ends the walk.
    Insert,
    /// Every ancestor up to the root is checked.
    Remove,
}

/// An ordered set of records threaded through an embedded [`IndexLink`].
///
/// `C` is a total order over records. Lookups by a key that is not a whole
/// record go through the `*_by` variants, which take a probe returning the
/// ordering of a record relative to the key.
pub struct NodeTable<R, I, C> {
    root: Option<I>,
    count: usize,
    field: LinkField<R, IndexLink<I>>,
    compare: C,
}

impl<R, I, C> fmt::Debug for NodeTable<R, I, C>
where
    I: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTable")
            .field("root", &self.root)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<R, I, C> NodeTable<R, I, C>
where
    I: Copy + Eq + fmt::Debug,
    C: Fn(&R, &R) -> Ordering,
{
    pub fn new(field: LinkField<R, IndexLink<I>>, compare: C) -> Self {
        Self {
            root: None,
            count: 0,
            field,
            compare,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    // ===== Search =====

    /// Find the record comparing equal to `key`.
    pub fn lookup<S>(&self, store: &S, key: &R) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.lookup_by(store, |record| (self.compare)(record, key))
    }

    /// Find the record for which `probe` returns `Equal`.
    ///
    /// `probe(record)` must order the record relative to the sought key
    /// consistently with the table's comparator.
    pub fn lookup_by<S, P>(&self, store: &S, mut probe: P) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
        P: FnMut(&R) -> Ordering,
    {
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let record = store.record(id);
            cursor = match probe(record) {
                Ordering::Less => self.field.of(record).right,
                Ordering::Greater => self.field.of(record).left,
                Ordering::Equal => return Some(id),
            };
        }
        None
    }

    /// The smallest record `>= key`.
    pub fn lookup_equal_or_next<S>(&self, store: &S, key: &R) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.lookup_equal_or_next_by(store, |record| (self.compare)(record, key))
    }

    pub fn lookup_equal_or_next_by<S, P>(&self, store: &S, mut probe: P) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
        P: FnMut(&R) -> Ordering,
    {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let record = store.record(id);
            cursor = match probe(record) {
                Ordering::Less => self.field.of(record).right,
                Ordering::Greater => {
                    best = Some(id);
                    self.field.of(record).left
                }
                Ordering::Equal => return Some(id),
            };
        }
        best
    }

    /// The largest record `<= key`.
    pub fn lookup_equal_or_previous<S>(&self, store: &S, key: &R) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.lookup_equal_or_previous_by(store, |record| (self.compare)(record, key))
    }

    pub fn lookup_equal_or_previous_by<S, P>(&self, store: &S, mut probe: P) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
        P: FnMut(&R) -> Ordering,
    {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(id) = cursor {
            let record = store.record(id);
            cursor = match probe(record) {
                Ordering::Less => {
                    best = Some(id);
                    self.field.of(record).right
                }
                Ordering::Greater => self.field.of(record).left,
                Ordering::Equal => return Some(id),
            };
        }
        best
    }

    /// Whether `id` is linked into this table (as opposed to another table
    /// sharing the same link field, or none).
    pub fn contains<S>(&self, store: &S, id: I) -> bool
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        if !self.link(store, id).is_linked() {
            return false;
        }
        let mut top = id;
        while let Some(parent) = self.link(store, top).parent {
            top = parent;
        }
        self.root == Some(top)
    }

    // ===== Traversal =====

    pub fn first<S>(&self, store: &S) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.root.map(|root| self.leftmost(store, root))
    }

    pub fn last<S>(&self, store: &S) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.root.map(|root| self.rightmost(store, root))
    }

    /// In-order successor of a linked record.
    pub fn next<S>(&self, store: &S, id: I) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        debug_assert!(self.link(store, id).is_linked(), "next() on unlinked record {id:?}");
        if let Some(right) = self.link(store, id).right {
            return Some(self.leftmost(store, right));
        }
        let mut child = id;
        let mut parent = self.link(store, id).parent;
        while let Some(p) = parent {
            if self.link(store, p).right != Some(child) {
                break;
            }
            child = p;
            parent = self.link(store, p).parent;
        }
        parent
    }

    /// In-order predecessor of a linked record.
    pub fn previous<S>(&self, store: &S, id: I) -> Option<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        debug_assert!(self.link(store, id).is_linked(), "previous() on unlinked record {id:?}");
        if let Some(left) = self.link(store, id).left {
            return Some(self.rightmost(store, left));
        }
        let mut child = id;
        let mut parent = self.link(store, id).parent;
        while let Some(p) = parent {
            if self.link(store, p).left != Some(child) {
                break;
            }
            child = p;
            parent = self.link(store, p).parent;
        }
        parent
    }

    /// Ascending iteration over record identities.
    pub fn iter<'a, S>(&'a self, store: &'a S) -> Iter<'a, R, I, C, S>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        Iter {
            table: self,
            store,
            cursor: self.first(store),
        }
    }

    // ===== Mutation =====

    /// Link `id` into the table.
    ///
    /// Returns `false`, leaving the table untouched, when a record comparing
    /// equal is already present.
    pub fn insert<S>(&mut self, store: &mut S, id: I) -> bool
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        debug_assert!(
            !self.link(store, id).is_linked(),
            "insert() of record {id:?} that is already linked"
        );

        let mut parent = None;
        let mut went_left = false;
        let mut cursor = self.root;
        while let Some(current) = cursor {
            let link = self.link(store, current);
            cursor = match (self.compare)(store.record(id), store.record(current)) {
                Ordering::Less => {
                    went_left = true;
                    link.left
                }
                Ordering::Greater => {
                    went_left = false;
                    link.right
                }
                Ordering::Equal => return false,
            };
            parent = Some(current);
        }

        *self.link_mut(store, id) = IndexLink {
            parent,
            left: None,
            right: None,
            height: 1,
        };
        match parent {
            None => self.root = Some(id),
            Some(p) if went_left => self.link_mut(store, p).left = Some(id),
            Some(p) => self.link_mut(store, p).right = Some(id),
        }
        self.count += 1;

        self.retrace(store, parent, Retrace::Insert);
        true
    }

    /// Unlink `id` from the table.
    pub fn remove<S>(&mut self, store: &mut S, id: I)
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        debug_assert!(self.contains(store, id), "remove() of record {id:?} not in table");

        let IndexLink {
            parent,
            left,
            right,
            height,
        } = *self.link(store, id);

        let retrace_from = match (left, right) {
            (Some(left), Some(right)) => {
                // Splice the in-order successor into the removed node's place.
                let successor = self.leftmost(store, right);
                let successor_link = *self.link(store, successor);
                let retrace_from = match successor_link.parent {
                    Some(successor_parent) if successor_parent != id => {
                        self.link_mut(store, successor_parent).left = successor_link.right;
                        if let Some(orphan) = successor_link.right {
                            self.link_mut(store, orphan).parent = Some(successor_parent);
                        }
                        self.link_mut(store, successor).right = Some(right);
                        self.link_mut(store, right).parent = Some(successor);
                        successor_parent
                    }
                    _ => successor,
                };

                let link = self.link_mut(store, successor);
                link.left = Some(left);
                link.parent = parent;
                link.height = height;
                self.link_mut(store, left).parent = Some(successor);
                self.replace_child(store, parent, id, Some(successor));
                Some(retrace_from)
            }
            _ => {
                let child = left.or(right);
                if let Some(child) = child {
                    self.link_mut(store, child).parent = parent;
                }
                self.replace_child(store, parent, id, child);
                parent
            }
        };

        *self.link_mut(store, id) = IndexLink::unlinked();
        self.count -= 1;

        self.retrace(store, retrace_from, Retrace::Remove);
    }

    // ===== Verification =====

    /// Check the AVL height invariant, the key order, parent back-links and
    /// the count against the actual tree. Uses bounded stack recursion only.
    pub fn verify_table<S>(&self, store: &S) -> bool
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let Some(root) = self.root else {
            return self.count == 0;
        };
        if self.link(store, root).parent.is_some() {
            debug!(?root, "root has a parent");
            return false;
        }
        match self.verify_subtree(store, root, None, None, 0) {
            Some((_, count)) if count == self.count => true,
            Some((_, count)) => {
                debug!(count, expected = self.count, "table count mismatch");
                false
            }
            None => false,
        }
    }

    fn verify_subtree<S>(
        &self,
        store: &S,
        id: I,
        low: Option<I>,
        high: Option<I>,
        depth: usize,
    ) -> Option<(u32, usize)>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        if depth > MAX_VERIFY_DEPTH {
            debug!(?id, depth, "tree deeper than any balanced tree");
            return None;
        }

        let link = *self.link(store, id);
        let record = store.record(id);
        if let Some(low) = low {
            if (self.compare)(store.record(low), record) != Ordering::Less {
                debug!(?id, ?low, "key ordering violated");
                return None;
            }
        }
        if let Some(high) = high {
            if (self.compare)(record, store.record(high)) != Ordering::Less {
                debug!(?id, ?high, "key ordering violated");
                return None;
            }
        }

        let mut heights = [0u32; 2];
        let mut count = 1;
        for (slot, child, bounds) in [
            (0, link.left, (low, Some(id))),
            (1, link.right, (Some(id), high)),
        ] {
            let Some(child) = child else { continue };
            if self.link(store, child).parent != Some(id) {
                debug!(?id, ?child, "broken parent link");
                return None;
            }
            let (height, subtree_count) =
                self.verify_subtree(store, child, bounds.0, bounds.1, depth + 1)?;
            heights[slot] = height;
            count += subtree_count;
        }

        if heights[0].abs_diff(heights[1]) > 1 {
            debug!(?id, left = heights[0], right = heights[1], "subtree out of balance");
            return None;
        }
        let height = 1 + heights[0].max(heights[1]);
        if height != link.height {
            debug!(?id, stored = link.height, actual = height, "stale height");
            return None;
        }
        Some((height, count))
    }

    // ===== Linkage helpers =====

    #[inline]
    fn link<'s, S>(&self, store: &'s S, id: I) -> &'s IndexLink<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
        R: 's,
    {
        self.field.of(store.record(id))
    }

    #[inline]
    fn link_mut<'s, S>(&self, store: &'s mut S, id: I) -> &'s mut IndexLink<I>
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
        R: 's,
    {
        self.field.of_mut(store.record_mut(id))
    }

    fn height<S>(&self, store: &S, id: Option<I>) -> u32
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        id.map_or(0, |id| self.link(store, id).height)
    }

    fn balance<S>(&self, store: &S, id: I) -> i64
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let link = self.link(store, id);
        i64::from(self.height(store, link.left)) - i64::from(self.height(store, link.right))
    }

    fn update_height<S>(&self, store: &mut S, id: I) -> u32
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let link = *self.link(store, id);
        let height = 1 + self.height(store, link.left).max(self.height(store, link.right));
        self.link_mut(store, id).height = height;
        height
    }

    fn leftmost<S>(&self, store: &S, mut id: I) -> I
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        while let Some(left) = self.link(store, id).left {
            id = left;
        }
        id
    }

    fn rightmost<S>(&self, store: &S, mut id: I) -> I
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        while let Some(right) = self.link(store, id).right {
            id = right;
        }
        id
    }

    fn replace_child<S>(&mut self, store: &mut S, parent: Option<I>, old: I, new: Option<I>)
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        match parent {
            None => self.root = new,
            Some(parent) => {
                let link = self.link_mut(store, parent);
                if link.left == Some(old) {
                    link.left = new;
                } else {
                    debug_assert_eq!(link.right, Some(old), "{old:?} is not a child of {parent:?}");
                    link.right = new;
                }
            }
        }
    }

    // ===== Rebalancing =====

    fn retrace<S>(&mut self, store: &mut S, mut node: Option<I>, mode: Retrace)
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        while let Some(id) = node {
            let parent = self.link(store, id).parent;
            let old_height = self.link(store, id).height;
            let rotated = self.rebalance(store, id);
            if mode == Retrace::Insert {
                if rotated {
                    break;
                }
                if self.link(store, id).height == old_height {
                    break;
                }
            }
            node = parent;
        }
    }

    /// Restore balance at `id`. Returns whether a rotation happened.
    fn rebalance<S>(&mut self, store: &mut S, id: I) -> bool
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        self.update_height(store, id);
        let balance = self.balance(store, id);
        if balance > 1 {
            if let Some(left) = self.link(store, id).left {
                if self.balance(store, left) < 0 {
                    self.rotate_left(store, left);
                }
            }
            self.rotate_right(store, id);
            true
        } else if balance < -1 {
            if let Some(right) = self.link(store, id).right {
                if self.balance(store, right) > 0 {
                    self.rotate_right(store, right);
                }
            }
            self.rotate_left(store, id);
            true
        } else {
            false
        }
    }

    fn rotate_left<S>(&mut self, store: &mut S, pivot: I) -> I
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let Some(heir) = self.link(store, pivot).right else {
            debug_assert!(false, "rotate_left() without right child at {pivot:?}");
            return pivot;
        };
        let parent = self.link(store, pivot).parent;
        let inner = self.link(store, heir).left;

        self.link_mut(store, pivot).right = inner;
        if let Some(inner) = inner {
            self.link_mut(store, inner).parent = Some(pivot);
        }
        self.link_mut(store, heir).left = Some(pivot);
        self.link_mut(store, pivot).parent = Some(heir);
        self.link_mut(store, heir).parent = parent;
        self.replace_child(store, parent, pivot, Some(heir));

        self.update_height(store, pivot);
        self.update_height(store, heir);
        heir
    }

    fn rotate_right<S>(&mut self, store: &mut S, pivot: I) -> I
    where
        S: Addressing<Record = R, Id = I> + ?Sized,
    {
        let Some(heir) = self.link(store, pivot).left else {
            debug_assert!(false, "rotate_right() without left child at {pivot:?}");
            return pivot;
        };
        let parent = self.link(store, pivot).parent;
        let inner = self.link(store, heir).right;

        self.link_mut(store, pivot).left = inner;
        if let Some(inner) = inner {
            self.link_mut(store, inner).parent = Some(pivot);
        }
        self.link_mut(store, heir).right = Some(pivot);
        self.link_mut(store, pivot).parent = Some(heir);
        self.link_mut(store, heir).parent = parent;
        self.replace_child(store, parent, pivot, Some(heir));

        self.update_height(store, pivot);
        self.update_height(store, heir);
        heir
    }
}

/// Ascending iterator over a [`NodeTable`].
pub struct Iter<'a, R, I, C, S: ?Sized> {
    table: &'a NodeTable<R, I, C>,
    store: &'a S,
    cursor: Option<I>,
}

impl<R, I, C, S> Iterator for Iter<'_, R, I, C, S>
where
    I: Copy + Eq + fmt::Debug,
    C: Fn(&R, &R) -> Ordering,
    S: Addressing<Record = R, Id = I> + ?Sized,
{
    type Item = I;

    fn next(&mut self) -> Option<I> {
        let id = self.cursor?;
        self.cursor = self.table.next(self.store, id);
        Some(id)
    }
}
