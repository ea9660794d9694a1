//! # Index Pages
//!
//! Index pages hold `(child, key)` slot pairs, 16 bytes each:
//!
//! ```text
//! +-----+-----+-------+-----+--------------------------------------------+
//! | tag | pad | count | pad | (2*kx+2) x (child: 8 | key: 8)             |
//! +-----+-----+-------+-----+--------------------------------------------+
//! 0     4     8       12    16
//! ```
//!
//! A page with `count` separators uses `count + 1` slots: slot `i` holds the
//! child to the left of separator `i`, and slot `count` holds the rightmost
//! child with its key half unused (the right-open sentinel). The key half of
//! a slot is not key bytes but the offset of a key slot inside a leaf, so a
//! separator compares through the same callback as any stored key.
//!
//! Slot ranges move with the same staged-copy primitive as leaf items; an
//! index page is at most `(2*kx+2)*16` bytes of slots, so a single staging
//! chunk always covers it and intra-page overlapping shifts are safe.

use eyre::{bail, ensure, Result};

use super::{BTree, IndexPage, TAG_INDEX};
use crate::buffer;
use crate::storage::{read_exact, read_i32, read_i64, write_all, write_i32, write_i64, Storage};

const OFF_TAG: i64 = 0;
const OFF_COUNT: i64 = 8;

/// Index page header size; slots start here.
pub(crate) const INDEX_HDR: i64 = 16;

/// Size of one (child, key) slot.
pub(crate) const INDEX_SLOT: i64 = 16;

impl BTree {
    pub(crate) fn index_size(&self) -> i64 {
        INDEX_HDR + (2 * self.kx as i64 + 2) * INDEX_SLOT
    }

    /// Allocates an index page with zero separators. `child0`, when nonzero,
    /// becomes the leftmost child.
    pub(crate) fn alloc_index<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        child0: i64,
    ) -> Result<IndexPage> {
        let x = IndexPage(store.alloc(self.index_size())?);
        write_i32(store, x.0 + OFF_TAG, TAG_INDEX)?;
        self.set_index_count(store, x, 0)?;
        if child0 != 0 {
            self.set_child_at(store, x, 0, child0)?;
        }
        Ok(x)
    }

    pub(crate) fn index_count<S: Storage + ?Sized>(
        &self,
        store: &S,
        x: IndexPage,
    ) -> Result<usize> {
        let n = read_i32(store, x.0 + OFF_COUNT)?;
        ensure!(
            n >= 0,
            "corrupted database: negative separator count {} at offset {}",
            n,
            x.0
        );
        Ok(n as usize)
    }

    pub(crate) fn set_index_count<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        x: IndexPage,
        n: usize,
    ) -> Result<()> {
        write_i32(store, x.0 + OFF_COUNT, n as i32)
    }

    fn slot_off(&self, x: IndexPage, i: usize) -> i64 {
        x.0 + INDEX_HDR + i as i64 * INDEX_SLOT
    }

    pub(crate) fn child_at<S: Storage + ?Sized>(
        &self,
        store: &S,
        x: IndexPage,
        i: usize,
    ) -> Result<i64> {
        read_i64(store, self.slot_off(x, i))
    }

    pub(crate) fn set_child_at<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        x: IndexPage,
        i: usize,
        child: i64,
    ) -> Result<()> {
        write_i64(store, self.slot_off(x, i), child)
    }

    /// The key-slot offset stored as separator `i`.
    pub(crate) fn separator_at<S: Storage + ?Sized>(
        &self,
        store: &S,
        x: IndexPage,
        i: usize,
    ) -> Result<i64> {
        read_i64(store, self.slot_off(x, i) + 8)
    }

    pub(crate) fn set_separator_at<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        x: IndexPage,
        i: usize,
        key: i64,
    ) -> Result<()> {
        write_i64(store, self.slot_off(x, i) + 8, key)
    }

    /// Copies `n` (child, key) slots from `src[si..]` to `dst[di..]`.
    /// The whole range is staged at once, so same-page overlap is fine.
    pub(crate) fn index_copy<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        dst: IndexPage,
        src: IndexPage,
        di: usize,
        si: usize,
        n: usize,
    ) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let nb = (n as i64 * INDEX_SLOT) as usize;
        let mut scratch = buffer::acquire(nb);
        read_exact(store, &mut scratch[..nb], self.slot_off(src, si))?;
        write_all(store, &scratch[..nb], self.slot_off(dst, di))
    }

    /// Binary search over the separators of `x`. Returns `(index, true)`
    /// when the search key equals separator `index`, else
    /// `(descent position, false)`.
    pub(crate) fn index_find<S, C>(
        &self,
        store: &S,
        x: IndexPage,
        cmp: &mut C,
    ) -> Result<(usize, bool)>
    where
        S: Storage + ?Sized,
        C: FnMut(&S, i64) -> Result<std::cmp::Ordering>,
    {
        let mut l: i64 = 0;
        let mut h = self.index_count(store, x)? as i64 - 1;
        while l <= h {
            let m = (l + h) >> 1;
            let k = self.separator_at(store, x, m as usize)?;
            match cmp(store, k)? {
                std::cmp::Ordering::Greater => l = m + 1,
                std::cmp::Ordering::Equal => return Ok((m as usize, true)),
                std::cmp::Ordering::Less => h = m - 1,
            }
        }
        Ok((l as usize, false))
    }

    /// Inserts separator `key` at position `i` with `child` as its right
    /// child, shifting later slots. The caller guarantees room (preventive
    /// splitting keeps every page on the descent path at most `2*kx` wide).
    pub(crate) fn index_insert_slot<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        x: IndexPage,
        i: usize,
        key: i64,
        child: i64,
    ) -> Result<()> {
        let c = self.index_count(store, x)?;
        if i < c {
            // the rightmost child must be saved before the pair shift
            // overwrites its slot
            let last = self.child_at(store, x, c)?;
            self.set_child_at(store, x, c + 1, last)?;
            self.index_copy(store, x, x, i + 2, i + 1, c - i - 1)?;
            let k = self.separator_at(store, x, i)?;
            self.set_separator_at(store, x, i + 1, k)?;
        }

        self.set_index_count(store, x, c + 1)?;
        self.set_separator_at(store, x, i, key)?;
        self.set_child_at(store, x, i + 1, child)
    }

    /// Removes separator `i` and its right child, shifting later slots left.
    pub(crate) fn index_extract<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        x: IndexPage,
        i: usize,
    ) -> Result<()> {
        let c = self.index_count(store, x)? - 1;
        self.set_index_count(store, x, c)?;
        if i < c {
            self.index_copy(store, x, x, i, i + 1, c - i)?;
            let ch = self.child_at(store, x, c + 1)?;
            self.set_child_at(store, x, c, ch)?;
        }
        Ok(())
    }

    /// Splits a full index page `q` during a `set` descent heading for slot
    /// `i`. The upper half moves to a new right page and `q`'s separator
    /// `kx` is promoted to the parent (or into a freshly allocated root).
    /// Returns the page and slot where the descent continues; when the
    /// insertion key collates at or after the promoted separator the descent
    /// must continue in the right page, keeping every key >= the separator
    /// on its right side.
    pub(crate) fn split_index<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        parent: Option<(IndexPage, usize)>,
        q: IndexPage,
        i: usize,
    ) -> Result<(IndexPage, usize)> {
        let r = self.alloc_index(store, 0)?;
        let c = self.index_count(store, q)?;

        self.index_copy(store, r, q, 0, self.kx + 1, c - self.kx)?;
        self.set_index_count(store, q, self.kx)?;
        self.set_index_count(store, r, self.kx)?;

        // slot kx still holds the promoted key; the count update above only
        // fences it off
        let promoted = self.separator_at(store, q, self.kx)?;
        match parent {
            Some((p, pi)) => self.index_insert_slot(store, p, pi, promoted, r.0)?,
            None => {
                let root = self.alloc_index(store, q.0)?;
                self.index_insert_slot(store, root, 0, promoted, r.0)?;
                self.set_root(store, root.0)?;
            }
        }

        if i > self.kx {
            Ok((r, i - self.kx - 1))
        } else {
            Ok((q, i))
        }
    }

    /// Rebalances an index page `q` that dropped below `kx` separators
    /// before a `delete` descends through it: borrow one entry from a
    /// sibling that can spare it, otherwise merge. `pi` is `q`'s slot in its
    /// parent `p` and `i` the descent position inside `q`; returns the page
    /// and position the descent continues with.
    pub(crate) fn index_underflow<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        p: IndexPage,
        q: IndexPage,
        pi: usize,
        i: usize,
    ) -> Result<(IndexPage, usize)> {
        let mut l = None;
        let mut r = None;
        if pi > 0 {
            l = Some(IndexPage(self.child_at(store, p, pi - 1)?));
        }
        if pi < self.index_count(store, p)? {
            r = Some(IndexPage(self.child_at(store, p, pi + 1)?));
        }

        let mut lc = 0;
        if let Some(l) = l {
            lc = self.index_count(store, l)?;
            if lc > self.kx {
                // rotate right: q shifts one slot up, takes l's tail child
                // and the parent separator; l's tail key moves to the parent
                let qc = self.index_count(store, q)?;
                let ch = self.child_at(store, q, qc)?;
                self.set_child_at(store, q, qc + 1, ch)?;
                self.index_copy(store, q, q, 1, 0, qc)?;
                let ch = self.child_at(store, l, lc)?;
                self.set_child_at(store, q, 0, ch)?;
                let k = self.separator_at(store, p, pi - 1)?;
                self.set_separator_at(store, q, 0, k)?;
                self.set_index_count(store, q, qc + 1)?;

                let lc = lc - 1;
                self.set_index_count(store, l, lc)?;
                let k = self.separator_at(store, l, lc)?;
                self.set_separator_at(store, p, pi - 1, k)?;
                return Ok((q, i + 1));
            }
        }

        if let Some(r) = r {
            let rc = self.index_count(store, r)?;
            if rc > self.kx {
                // rotate left: the parent separator and r's head child
                // append to q; r's head key moves to the parent
                let k = self.separator_at(store, p, pi)?;
                let qc = self.index_count(store, q)?;
                self.set_separator_at(store, q, qc, k)?;
                let qc = qc + 1;
                self.set_index_count(store, q, qc)?;
                let ch = self.child_at(store, r, 0)?;
                self.set_child_at(store, q, qc, ch)?;
                let k = self.separator_at(store, r, 0)?;
                self.set_separator_at(store, p, pi, k)?;

                self.index_copy(store, r, r, 0, 1, rc - 1)?;
                let rc = rc - 1;
                self.set_index_count(store, r, rc)?;
                let ch = self.child_at(store, r, rc + 1)?;
                self.set_child_at(store, r, rc, ch)?;
                return Ok((q, i));
            }
        }

        if let Some(l) = l {
            self.index_merge(store, p, l, q, pi - 1)?;
            return Ok((l, i + lc + 1));
        }
        match r {
            Some(r) => {
                self.index_merge(store, p, q, r, pi)?;
                Ok((q, i))
            }
            None => bail!(
                "corrupted database: index page at offset {} underflowed with no siblings",
                q.0
            ),
        }
    }

    /// Concatenates index page `r` into its left neighbor `q`: the parent
    /// separator `pi` comes down between them, `r`'s slots append, and the
    /// parent contracts by one slot. A parent left with a single child is a
    /// redundant root: it is freed and `q` becomes the root.
    pub(crate) fn index_merge<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        p: IndexPage,
        q: IndexPage,
        r: IndexPage,
        pi: usize,
    ) -> Result<()> {
        let k = self.separator_at(store, p, pi)?;
        let qc = self.index_count(store, q)?;
        self.set_separator_at(store, q, qc, k)?;

        let rc = self.index_count(store, r)?;
        self.index_copy(store, q, r, qc + 1, 0, rc)?;
        let qc = qc + rc + 1;
        self.set_index_count(store, q, qc)?;
        let ch = self.child_at(store, r, rc)?;
        self.set_child_at(store, q, qc, ch)?;
        store.free(r.0)?;

        let pc = self.index_count(store, p)?;
        if pc > 1 {
            let pc = pc - 1;
            self.set_index_count(store, p, pc)?;
            if pi < pc {
                // drop separator pi but keep child pi (the merged page)
                let k = self.separator_at(store, p, pi + 1)?;
                self.set_separator_at(store, p, pi, k)?;
                self.index_copy(store, p, p, pi + 1, pi + 2, pc - pi - 1)?;
                let ch = self.child_at(store, p, pc + 1)?;
                self.set_child_at(store, p, pc, ch)?;
            }
            return Ok(());
        }

        let root = self.root(store)?;
        store.free(root)?;
        self.set_root(store, q.0)
    }
}
