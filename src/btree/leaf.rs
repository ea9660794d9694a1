//! # Leaf Pages
//!
//! Leaf pages store the tree's items as `(key, value)` slot pairs at fixed
//! offsets, with no in-page framing:
//!
//! ```text
//! +-----+-----+-------+-----+--------+--------+----------------------------+
//! | tag | pad | count | pad | prev   | next   | (2*kd+1) x (key | value)   |
//! +-----+-----+-------+-----+--------+--------+----------------------------+
//! 0     4     8       12    16       24       32
//! ```
//!
//! Item `i`'s key slot lives at `32 + i*(szKey+szVal)`; its value slot
//! follows the key immediately. The extra `+1` slot beyond the `2*kd` live
//! capacity is overflow room: the insertion position is opened first and the
//! page split afterwards, and the hole must always be in bounds.
//!
//! ## Slot-Range Copies
//!
//! Shifting items for insert/extract and moving items between sibling leaves
//! both reduce to one primitive, [`BTree::leaf_copy`], a staged byte copy
//! through a pooled scratch buffer. Reading the whole source range before
//! writing makes the intra-page overlapping cases (`di = si ± 1`) correct as
//! long as the range fits one staging chunk; chunking only kicks in past the
//! 64 MiB cap, far beyond any overlapping page-local range.
//!
//! ## Rebalancing
//!
//! The leaf-level rebalancing lives here as well: split with leaf-chain
//! relinking, the overflow path that prefers donating one item to a sibling
//! over splitting, and the underflow path that prefers borrowing one item
//! over merging.

use eyre::{bail, ensure, Result};

use super::{BTree, IndexPage, LeafPage, TAG_LEAF};
use crate::buffer;
use crate::storage::{read_i32, read_i64, write_i32, write_i64, Storage};

const OFF_TAG: i64 = 0;
const OFF_COUNT: i64 = 8;
const OFF_PREV: i64 = 16;
const OFF_NEXT: i64 = 24;

/// Leaf page header size; item slots start here.
pub(crate) const LEAF_HDR: i64 = 32;

/// Staging cap for slot-range copies. Ranges wider than this are copied in
/// chunks, which is only valid for non-overlapping ranges.
const MAX_COPY_CHUNK: i64 = 64 << 20;

impl BTree {
    pub(crate) fn leaf_size(&self) -> i64 {
        LEAF_HDR + (2 * self.kd as i64 + 1) * (self.sz_key + self.sz_val)
    }

    /// Allocates a leaf with zero items and no chain neighbors.
    pub(crate) fn alloc_leaf<S: Storage + ?Sized>(&self, store: &mut S) -> Result<LeafPage> {
        let d = LeafPage(store.alloc(self.leaf_size())?);
        write_i32(store, d.0 + OFF_TAG, TAG_LEAF)?;
        self.set_leaf_count(store, d, 0)?;
        self.set_leaf_next(store, d, 0)?;
        self.set_leaf_prev(store, d, 0)?;
        Ok(d)
    }

    pub(crate) fn leaf_count<S: Storage + ?Sized>(&self, store: &S, d: LeafPage) -> Result<usize> {
        let n = read_i32(store, d.0 + OFF_COUNT)?;
        ensure!(
            n >= 0,
            "corrupted database: negative item count {} at offset {}",
            n,
            d.0
        );
        Ok(n as usize)
    }

    pub(crate) fn set_leaf_count<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        n: usize,
    ) -> Result<()> {
        write_i32(store, d.0 + OFF_COUNT, n as i32)
    }

    pub(crate) fn leaf_prev<S: Storage + ?Sized>(&self, store: &S, d: LeafPage) -> Result<i64> {
        read_i64(store, d.0 + OFF_PREV)
    }

    pub(crate) fn leaf_next<S: Storage + ?Sized>(&self, store: &S, d: LeafPage) -> Result<i64> {
        read_i64(store, d.0 + OFF_NEXT)
    }

    pub(crate) fn set_leaf_prev<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        prev: i64,
    ) -> Result<()> {
        write_i64(store, d.0 + OFF_PREV, prev)
    }

    pub(crate) fn set_leaf_next<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        next: i64,
    ) -> Result<()> {
        write_i64(store, d.0 + OFF_NEXT, next)
    }

    /// Offset of item `i`'s key slot.
    pub(crate) fn key_off(&self, d: LeafPage, i: usize) -> i64 {
        d.0 + LEAF_HDR + i as i64 * (self.sz_key + self.sz_val)
    }

    /// Offset of item `i`'s value slot, immediately after its key slot.
    pub(crate) fn val_off(&self, d: LeafPage, i: usize) -> i64 {
        self.key_off(d, i) + self.sz_key
    }

    /// Copies `n` item slots from `src[si..]` to `dst[di..]`, staging the
    /// bytes through a scratch buffer. `src` and `dst` may be the same page
    /// with overlapping ranges.
    pub(crate) fn leaf_copy<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        dst: LeafPage,
        src: LeafPage,
        di: usize,
        si: usize,
        n: usize,
    ) -> Result<()> {
        let mut rem = (self.sz_key + self.sz_val) * n as i64;
        if rem == 0 {
            return Ok(());
        }

        let mut dst_off = self.key_off(dst, di);
        let mut src_off = self.key_off(src, si);
        let chunk = rem.min(MAX_COPY_CHUNK) as usize;
        let mut scratch = buffer::acquire(chunk);
        while rem > 0 {
            let rq = (rem as usize).min(chunk);
            crate::storage::read_exact(store, &mut scratch[..rq], src_off)?;
            crate::storage::write_all(store, &scratch[..rq], dst_off)?;
            src_off += rq as i64;
            dst_off += rq as i64;
            rem -= rq as i64;
        }
        Ok(())
    }

    /// Binary search over the items of `d`. Returns `(index, true)` on an
    /// exact match, or `(insertion position, false)` otherwise.
    pub(crate) fn leaf_find<S, C>(
        &self,
        store: &S,
        d: LeafPage,
        cmp: &mut C,
    ) -> Result<(usize, bool)>
    where
        S: Storage + ?Sized,
        C: FnMut(&S, i64) -> Result<std::cmp::Ordering>,
    {
        let mut l: i64 = 0;
        let mut h = self.leaf_count(store, d)? as i64 - 1;
        while l <= h {
            let m = (l + h) >> 1;
            match cmp(store, self.key_off(d, m as usize))? {
                std::cmp::Ordering::Greater => l = m + 1,
                std::cmp::Ordering::Equal => return Ok((m as usize, true)),
                std::cmp::Ordering::Less => h = m - 1,
            }
        }
        Ok((l as usize, false))
    }

    /// Opens a hole at slot `i`, shifting later items right, and bumps both
    /// the page count and the tree length. The caller fills the slot.
    pub(crate) fn leaf_open_slot<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        i: usize,
    ) -> Result<()> {
        let c = self.leaf_count(store, d)?;
        if i < c {
            self.leaf_copy(store, d, d, i + 1, i, c - i)?;
        }
        self.set_leaf_count(store, d, c + 1)?;

        let n = self.len(store)?;
        self.set_len(store, n + 1)
    }

    /// Closes slot `i`, shifting later items left, invoking `free` with the
    /// removed item's slot offsets, and decrementing the tree length.
    pub(crate) fn leaf_extract<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        i: usize,
        free: &mut Option<super::FreeItem<'_, S>>,
    ) -> Result<()> {
        let c = self.leaf_count(store, d)?;
        if let Some(f) = free.as_deref_mut() {
            f(store, self.key_off(d, i), self.val_off(d, i))?;
        }

        let c = c - 1;
        self.set_leaf_count(store, d, c)?;
        if i < c {
            self.leaf_copy(store, d, d, i, i + 1, c - i)?;
        }

        let n = self.len(store)?;
        self.set_len(store, n - 1)
    }

    /// Moves `n` items from the front of `src` onto the end of `dst`.
    /// `dst_count` is `dst`'s current item count.
    pub(crate) fn leaf_move_left<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        dst: LeafPage,
        src: LeafPage,
        dst_count: usize,
        n: usize,
    ) -> Result<()> {
        self.leaf_copy(store, dst, src, dst_count, 0, n)?;
        let sc = self.leaf_count(store, src)?;
        self.leaf_copy(store, src, src, 0, n, sc - n)?;
        self.set_leaf_count(store, dst, dst_count + n)?;
        self.set_leaf_count(store, src, sc - n)
    }

    /// Moves `n` items from the end of `src` onto the front of `dst`.
    /// `dst_count` is `dst`'s current item count.
    pub(crate) fn leaf_move_right<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        src: LeafPage,
        dst: LeafPage,
        dst_count: usize,
        n: usize,
    ) -> Result<()> {
        self.leaf_copy(store, dst, dst, n, 0, dst_count)?;
        let sc = self.leaf_count(store, src)?;
        self.leaf_copy(store, dst, src, 0, sc - n, n)?;
        self.set_leaf_count(store, dst, dst_count + n)?;
        self.set_leaf_count(store, src, sc - n)
    }

    /// Resolves the leaf siblings of the child at parent slot `pi`.
    pub(crate) fn leaf_siblings<S: Storage + ?Sized>(
        &self,
        store: &S,
        parent: Option<(IndexPage, usize)>,
    ) -> Result<(Option<LeafPage>, Option<LeafPage>)> {
        let Some((p, pi)) = parent else {
            return Ok((None, None));
        };

        let mut l = None;
        let mut r = None;
        if pi > 0 {
            l = Some(LeafPage(self.child_at(store, p, pi - 1)?));
        }
        if pi < self.index_count(store, p)? {
            r = Some(LeafPage(self.child_at(store, p, pi + 1)?));
        }
        Ok((l, r))
    }

    /// Makes room in a full leaf for an insertion at slot `i`: donate one
    /// item to an unfull sibling when possible, otherwise split. Returns the
    /// page and slot where the hole was opened.
    pub(crate) fn leaf_overflow<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        parent: Option<(IndexPage, usize)>,
        i: usize,
    ) -> Result<(LeafPage, usize)> {
        let (l, r) = self.leaf_siblings(store, parent)?;

        if let (Some((p, pi)), Some(l)) = (parent, l) {
            let lc = self.leaf_count(store, l)?;
            if lc < 2 * self.kd && i != 0 {
                self.leaf_move_left(store, l, d, lc, 1)?;
                self.leaf_open_slot(store, d, i - 1)?;
                self.set_separator_at(store, p, pi - 1, self.key_off(d, 0))?;
                return Ok((d, i - 1));
            }
        }

        if let (Some((p, pi)), Some(r)) = (parent, r) {
            let rc = self.leaf_count(store, r)?;
            if rc < 2 * self.kd {
                if i < 2 * self.kd {
                    self.leaf_move_right(store, d, r, rc, 1)?;
                    self.leaf_open_slot(store, d, i)?;
                    self.set_separator_at(store, p, pi, self.key_off(r, 0))?;
                    return Ok((d, i));
                }

                // the insertion point is past d's last slot: it belongs at
                // the head of the right sibling
                self.leaf_open_slot(store, r, 0)?;
                self.set_separator_at(store, p, pi, self.key_off(r, 0))?;
                return Ok((r, 0));
            }
        }

        self.split_leaf(store, d, parent, i)
    }

    /// Splits a full leaf around an insertion at slot `i`. The new right
    /// page takes the upper half of the items and `d`'s place in the chain
    /// after `d`; the separator published to the parent is the offset of the
    /// right page's first key slot. Without a parent, a new index root is
    /// allocated. Returns the page and slot where the hole was opened.
    pub(crate) fn split_leaf<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        parent: Option<(IndexPage, usize)>,
        i: usize,
    ) -> Result<(LeafPage, usize)> {
        let r = self.alloc_leaf(store)?;

        let n = self.leaf_next(store, d)?;
        if n != 0 {
            self.set_leaf_next(store, r, n)?;
            self.set_leaf_prev(store, LeafPage(n), r.0)?;
        } else {
            self.set_last(store, r.0)?;
        }
        self.set_leaf_next(store, d, r.0)?;
        self.set_leaf_prev(store, r, d.0)?;

        self.leaf_copy(store, r, d, 0, self.kd, self.kd)?;
        self.set_leaf_count(store, d, self.kd)?;
        self.set_leaf_count(store, r, self.kd)?;

        let target = if i > self.kd {
            let j = i - self.kd;
            self.leaf_open_slot(store, r, j)?;
            Some((r, j))
        } else {
            None
        };

        match parent {
            Some((p, pi)) => self.index_insert_slot(store, p, pi, self.key_off(r, 0), r.0)?,
            None => {
                let x = self.alloc_index(store, d.0)?;
                self.index_insert_slot(store, x, 0, self.key_off(r, 0), r.0)?;
                self.set_root(store, x.0)?;
            }
        }

        match target {
            Some(t) => Ok(t),
            None => {
                self.leaf_open_slot(store, d, i)?;
                Ok((d, i))
            }
        }
    }

    /// Refills an underfull leaf after an extraction: borrow one item from a
    /// sibling that can spare it, otherwise merge with a sibling, preferring
    /// the left one.
    pub(crate) fn leaf_underflow<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        d: LeafPage,
        parent: (IndexPage, usize),
    ) -> Result<()> {
        let (p, pi) = parent;
        let (l, r) = self.leaf_siblings(store, Some(parent))?;

        if let Some(l) = l {
            let lc = self.leaf_count(store, l)?;
            let dc = self.leaf_count(store, d)?;
            if lc + dc >= 2 * self.kd {
                self.leaf_move_right(store, l, d, dc, 1)?;
                return self.set_separator_at(store, p, pi - 1, self.key_off(d, 0));
            }
        }

        if let Some(r) = r {
            let dc = self.leaf_count(store, d)?;
            let rc = self.leaf_count(store, r)?;
            if dc + rc >= 2 * self.kd {
                self.leaf_move_left(store, d, r, dc, 1)?;
                return self.set_separator_at(store, p, pi, self.key_off(r, 0));
            }
        }

        match (l, r) {
            (Some(l), _) => self.leaf_merge(store, p, l, d, pi - 1),
            (None, Some(r)) => self.leaf_merge(store, p, d, r, pi),
            (None, None) => bail!(
                "corrupted database: leaf at offset {} underflowed with no siblings",
                d.0
            ),
        }
    }

    /// Concatenates leaf `r` into its left neighbor `q`, unlinks `r` from
    /// the chain and frees it, then drops separator `pi` from the parent.
    /// A parent left with a single child is a redundant root: it is freed
    /// and `q` becomes the root.
    pub(crate) fn leaf_merge<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        p: IndexPage,
        q: LeafPage,
        r: LeafPage,
        pi: usize,
    ) -> Result<()> {
        let rc = self.leaf_count(store, r)?;
        let qc = self.leaf_count(store, q)?;
        self.leaf_move_left(store, q, r, qc, rc)?;

        let rn = self.leaf_next(store, r)?;
        if rn != 0 {
            self.set_leaf_prev(store, LeafPage(rn), q.0)?;
        } else {
            self.set_last(store, q.0)?;
        }
        self.set_leaf_next(store, q, rn)?;
        store.free(r.0)?;

        if self.index_count(store, p)? > 1 {
            self.index_extract(store, p, pi)?;
            return self.set_child_at(store, p, pi, q.0);
        }

        let root = self.root(store)?;
        store.free(root)?;
        self.set_root(store, q.0)
    }
}
