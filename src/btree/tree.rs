//! # Tree Operations
//!
//! The top-level operations: handle lifecycle (`create`/`open`), point
//! lookup, ordered insert and delete with top-down preventive rebalancing,
//! bulk clear/remove, and the seek entry points that produce cursors.
//!
//! ## Descent Shape
//!
//! Every operation starts at the header, reads the root offset, and walks
//! down one page at a time, resolving a single child offset per level. The
//! only state carried across levels is the parent page handle and the slot
//! the descent came through; there is no path stack and no recursion except
//! in the whole-tree walks, which use an explicit offset stack.
//!
//! ## Insert (`set`)
//!
//! ```text
//! 1. Empty tree: allocate the first leaf, it becomes root/first/last.
//! 2. At an index page: find the descent slot; a separator hit descends to
//!    its right child. A page already holding more than 2*kx separators is
//!    split before descending, so a later separator publish always fits.
//! 3. At the leaf: a hit returns the existing slots (value free callback
//!    fires); a miss opens the slot in place, via a sibling donation, or
//!    through a leaf split.
//! ```
//!
//! ## Delete
//!
//! ```text
//! 1. At an index page: a page about to drop below kx separators is
//!    rebalanced (borrow or merge) before the descent passes through it.
//! 2. At the leaf: a miss returns false; a hit extracts the item. A leaf
//!    left under kd items refills from a sibling or merges; an emptied root
//!    leaf resets the tree to empty.
//! ```
//!
//! A separator hit during delete descends to `child(i+1)`: every key equal
//! to or after a separator lives in the subtree to its right.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};
use zerocopy::big_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{BTree, Cursor, FreeItem, FreeVal, IndexPage, LeafPage, Page, DEFAULT_FANOUT};
use super::{TAG_INDEX, TAG_LEAF};
use crate::storage::{self, read_i32, read_i64, write_i64, Storage};

/// Size of the tree header block.
pub(crate) const HDR_SIZE: i64 = 64;

const HDR_ROOT: i64 = 0;
const HDR_LEN: i64 = 8;
const HDR_FIRST: i64 = 16;
const HDR_LAST: i64 = 24;

/// The header block: eight big-endian i64 fields. `root`, `len`, `first`
/// and `last` are updated field-at-a-time through the storage helpers; the
/// struct is written whole at `create` and read whole at `open`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct TreeHeader {
    root: I64,
    len: I64,
    first: I64,
    last: I64,
    kd: I64,
    kx: I64,
    sz_key: I64,
    sz_val: I64,
}

const _: () = assert!(std::mem::size_of::<TreeHeader>() == HDR_SIZE as usize);

impl BTree {
    /// Allocates a new, empty tree.
    ///
    /// `sz_key` and `sz_val` are the fixed slot widths in bytes (either may
    /// be zero). `nd` and `nx` are the desired item counts per leaf and
    /// index page; 0 selects the default of 256. The half-capacities are
    /// `kd = max(nd/2, 1)` and `kx = max(nx/2, 2)`.
    ///
    /// # Panics
    ///
    /// Negative slot widths or fanouts beyond i32 range are programmer
    /// errors and panic.
    pub fn create<S: Storage + ?Sized>(
        store: &mut S,
        sz_key: i64,
        sz_val: i64,
        nd: usize,
        nx: usize,
    ) -> Result<BTree> {
        assert!(sz_key >= 0 && sz_val >= 0, "negative slot width");
        assert!(nd <= (i32::MAX as usize - 1) / 2, "leaf fanout out of range");
        assert!(nx <= (i32::MAX as usize - 2) / 2, "index fanout out of range");

        let nd = if nd == 0 { DEFAULT_FANOUT } else { nd };
        let nx = if nx == 0 { DEFAULT_FANOUT } else { nx };
        let kd = (nd / 2).max(1);
        let kx = (nx / 2).max(2);

        let off = store.calloc(HDR_SIZE)?;
        let hdr = TreeHeader {
            root: I64::new(0),
            len: I64::new(0),
            first: I64::new(0),
            last: I64::new(0),
            kd: I64::new(kd as i64),
            kx: I64::new(kx as i64),
            sz_key: I64::new(sz_key),
            sz_val: I64::new(sz_val),
        };
        storage::write_all(store, hdr.as_bytes(), off)?;

        Ok(BTree {
            off,
            sz_key,
            sz_val,
            kd,
            kx,
        })
    }

    /// Re-opens an existing tree from its header offset, validating the
    /// recorded parameters.
    pub fn open<S: Storage + ?Sized>(store: &S, off: i64) -> Result<BTree> {
        let mut buf = [0u8; HDR_SIZE as usize];
        storage::read_exact(store, &mut buf, off)?;
        let hdr = TreeHeader::read_from_bytes(&buf)
            .map_err(|e| eyre::eyre!("failed to parse tree header at offset {}: {:?}", off, e))?;

        let kd = hdr.kd.get();
        let kx = hdr.kx.get();
        let sz_key = hdr.sz_key.get();
        let sz_val = hdr.sz_val.get();
        ensure!(
            kd >= 1 && kd <= (i32::MAX as i64 - 1) / 2,
            "corrupted database: leaf half-capacity {} at offset {}",
            kd,
            off
        );
        ensure!(
            kx >= 2 && kx <= (i32::MAX as i64 - 2) / 2,
            "corrupted database: index half-capacity {} at offset {}",
            kx,
            off
        );
        ensure!(
            sz_key >= 0 && sz_val >= 0,
            "corrupted database: negative slot width at offset {}",
            off
        );

        Ok(BTree {
            off,
            sz_key,
            sz_val,
            kd: kd as usize,
            kx: kx as usize,
        })
    }

    /// Offset of the tree header; the durable identity of this tree.
    pub fn offset(&self) -> i64 {
        self.off
    }

    /// Fixed key slot width in bytes.
    pub fn key_size(&self) -> i64 {
        self.sz_key
    }

    /// Fixed value slot width in bytes.
    pub fn val_size(&self) -> i64 {
        self.sz_val
    }

    /// Leaf half-capacity: the minimum live item count of a non-root leaf.
    pub fn kd(&self) -> usize {
        self.kd
    }

    /// Index half-capacity: the minimum separator count of a non-root index
    /// page.
    pub fn kx(&self) -> usize {
        self.kx
    }

    /// Number of items in the tree.
    pub fn len<S: Storage + ?Sized>(&self, store: &S) -> Result<i64> {
        read_i64(store, self.off + HDR_LEN)
    }

    pub(crate) fn set_len<S: Storage + ?Sized>(&self, store: &mut S, n: i64) -> Result<()> {
        write_i64(store, self.off + HDR_LEN, n)
    }

    /// Offset of the leftmost leaf, or 0 when the tree is empty.
    pub fn first<S: Storage + ?Sized>(&self, store: &S) -> Result<i64> {
        read_i64(store, self.off + HDR_FIRST)
    }

    pub(crate) fn set_first<S: Storage + ?Sized>(&self, store: &mut S, d: i64) -> Result<()> {
        write_i64(store, self.off + HDR_FIRST, d)
    }

    /// Offset of the rightmost leaf, or 0 when the tree is empty.
    pub fn last<S: Storage + ?Sized>(&self, store: &S) -> Result<i64> {
        read_i64(store, self.off + HDR_LAST)
    }

    pub(crate) fn set_last<S: Storage + ?Sized>(&self, store: &mut S, d: i64) -> Result<()> {
        write_i64(store, self.off + HDR_LAST, d)
    }

    pub(crate) fn root<S: Storage + ?Sized>(&self, store: &S) -> Result<i64> {
        read_i64(store, self.off + HDR_ROOT)
    }

    pub(crate) fn set_root<S: Storage + ?Sized>(&self, store: &mut S, root: i64) -> Result<()> {
        write_i64(store, self.off + HDR_ROOT, root)
    }

    /// Reads the tag word at `off` and returns the typed page handle.
    pub(crate) fn open_page<S: Storage + ?Sized>(&self, store: &S, off: i64) -> Result<Page> {
        match read_i32(store, off)? {
            TAG_LEAF => Ok(Page::Leaf(LeafPage(off))),
            TAG_INDEX => Ok(Page::Index(IndexPage(off))),
            tag => bail!("corrupted database: unknown page tag {} at offset {}", tag, off),
        }
    }

    /// Searches for a key and returns the offset of its value slot.
    ///
    /// The comparator receives the offset of a stored key slot and ranks
    /// the search key against it (`Greater` = search key collates after).
    pub fn get<S, C>(&self, store: &S, mut cmp: C) -> Result<Option<i64>>
    where
        S: Storage + ?Sized,
        C: FnMut(&S, i64) -> Result<Ordering>,
    {
        let root = self.root(store)?;
        if root == 0 {
            return Ok(None);
        }

        let mut page = self.open_page(store, root)?;
        loop {
            match page {
                Page::Index(x) => {
                    let (i, hit) = self.index_find(store, x, &mut cmp)?;
                    let child = self.child_at(store, x, if hit { i + 1 } else { i })?;
                    page = self.open_page(store, child)?;
                }
                Page::Leaf(d) => {
                    let (i, hit) = self.leaf_find(store, d, &mut cmp)?;
                    return Ok(hit.then(|| self.val_off(d, i)));
                }
            }
        }
    }

    /// Adds or overwrites an item and returns its `(key, value)` slot
    /// offsets for the caller to fill.
    ///
    /// On a comparator hit the existing slots are returned unchanged and
    /// `free_old`, when given, fires with the value slot offset; the key
    /// slot is never reallocated on overwrite. On a miss a slot pair is
    /// opened at the ordered position and the tree length grows by one.
    pub fn set<S, C>(
        &self,
        store: &mut S,
        mut cmp: C,
        free_old: Option<FreeVal<'_, S>>,
    ) -> Result<(i64, i64)>
    where
        S: Storage + ?Sized,
        C: FnMut(&S, i64) -> Result<Ordering>,
    {
        let root = self.root(store)?;
        if root == 0 {
            let d = self.alloc_leaf(store)?;
            self.leaf_open_slot(store, d, 0)?;
            self.set_root(store, d.0)?;
            self.set_first(store, d.0)?;
            self.set_last(store, d.0)?;
            return Ok((self.key_off(d, 0), self.val_off(d, 0)));
        }

        let mut parent: Option<(IndexPage, usize)> = None;
        let mut page = self.open_page(store, root)?;
        loop {
            match page {
                Page::Index(x) => {
                    let (found, hit) = self.index_find(store, x, &mut cmp)?;
                    let mut x = x;
                    let mut i = if hit { found + 1 } else { found };
                    if self.index_count(store, x)? > 2 * self.kx {
                        (x, i) = self.split_index(store, parent, x, i)?;
                    }
                    parent = Some((x, i));
                    let child = self.child_at(store, x, i)?;
                    page = self.open_page(store, child)?;
                }
                Page::Leaf(d) => {
                    let (i, hit) = self.leaf_find(store, d, &mut cmp)?;
                    if hit {
                        let koff = self.key_off(d, i);
                        let voff = self.val_off(d, i);
                        if let Some(f) = free_old {
                            f(store, voff)?;
                        }
                        return Ok((koff, voff));
                    }

                    let (d, i) = if self.leaf_count(store, d)? < 2 * self.kd {
                        self.leaf_open_slot(store, d, i)?;
                        (d, i)
                    } else {
                        self.leaf_overflow(store, d, parent, i)?
                    };
                    return Ok((self.key_off(d, i), self.val_off(d, i)));
                }
            }
        }
    }

    /// Removes an item; returns whether the key was found. `free`, when
    /// given, fires once with the removed item's slot offsets.
    pub fn delete<S, C>(
        &self,
        store: &mut S,
        mut cmp: C,
        mut free: Option<FreeItem<'_, S>>,
    ) -> Result<bool>
    where
        S: Storage + ?Sized,
        C: FnMut(&S, i64) -> Result<Ordering>,
    {
        let root = self.root(store)?;
        if root == 0 {
            return Ok(false);
        }

        let mut parent: Option<(IndexPage, usize)> = None;
        let mut page = self.open_page(store, root)?;
        loop {
            match page {
                Page::Index(x) => {
                    let (found, hit) = self.index_find(store, x, &mut cmp)?;
                    let mut x = x;
                    let mut i = found;
                    // a page the descent came through cannot be the root
                    if let Some((p, pi)) = parent {
                        if self.index_count(store, x)? < self.kx {
                            (x, i) = self.index_underflow(store, p, x, pi, i)?;
                        }
                    }
                    if hit {
                        i += 1;
                    }
                    parent = Some((x, i));
                    let child = self.child_at(store, x, i)?;
                    page = self.open_page(store, child)?;
                }
                Page::Leaf(d) => {
                    let (i, hit) = self.leaf_find(store, d, &mut cmp)?;
                    if !hit {
                        return Ok(false);
                    }

                    self.leaf_extract(store, d, i, &mut free)?;
                    if self.leaf_count(store, d)? >= self.kd {
                        return Ok(true);
                    }

                    match parent {
                        Some(par) => self.leaf_underflow(store, d, par)?,
                        // the root leaf may run arbitrarily low; only a
                        // fully emptied tree collapses
                        None => {
                            if self.len(store)? == 0 {
                                self.clear(store, free)?;
                            }
                        }
                    }
                    return Ok(true);
                }
            }
        }
    }

    /// Deletes every item, freeing all pages and resetting the header.
    /// `free`, when given, fires once per item.
    pub fn clear<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        mut free: Option<FreeItem<'_, S>>,
    ) -> Result<()> {
        let root = self.root(store)?;
        if root == 0 {
            return Ok(());
        }

        self.clear_subtree(store, root, &mut free)?;
        self.set_len(store, 0)?;
        self.set_first(store, 0)?;
        self.set_last(store, 0)?;
        self.set_root(store, 0)
    }

    /// Frees all space used by the tree, including the header block. The
    /// handle is consumed; the offset no longer identifies a tree.
    pub fn remove<S: Storage + ?Sized>(
        self,
        store: &mut S,
        mut free: Option<FreeItem<'_, S>>,
    ) -> Result<()> {
        let root = self.root(store)?;
        if root != 0 {
            self.clear_subtree(store, root, &mut free)?;
        }
        store.free(self.off)
    }

    /// Frees every page under `root`, invoking `free` per leaf item. Walks
    /// with an explicit offset stack; the stack depth is bounded by the
    /// total page count, not the call stack.
    fn clear_subtree<S: Storage + ?Sized>(
        &self,
        store: &mut S,
        root: i64,
        free: &mut Option<FreeItem<'_, S>>,
    ) -> Result<()> {
        let mut stack: SmallVec<[i64; 16]> = smallvec![root];
        while let Some(off) = stack.pop() {
            match self.open_page(store, off)? {
                Page::Leaf(d) => {
                    if let Some(f) = free.as_deref_mut() {
                        let c = self.leaf_count(store, d)?;
                        let width = self.sz_key + self.sz_val;
                        let mut koff = self.key_off(d, 0);
                        let mut voff = self.val_off(d, 0);
                        for _ in 0..c {
                            f(store, koff, voff)?;
                            koff += width;
                            voff += width;
                        }
                    }
                    store.free(d.0)?;
                }
                Page::Index(x) => {
                    let c = self.index_count(store, x)?;
                    for i in 0..=c {
                        let child = self.child_at(store, x, i)?;
                        if child == 0 {
                            break;
                        }
                        stack.push(child);
                    }
                    store.free(x.0)?;
                }
            }
        }
        Ok(())
    }

    /// Searches like [`BTree::get`] but returns a cursor. On a hit the
    /// cursor sits on the found item; on a miss it sits at the insertion
    /// position, possibly past the end of the tree.
    pub fn seek<S, C>(&self, store: &S, mut cmp: C) -> Result<(Cursor, bool)>
    where
        S: Storage + ?Sized,
        C: FnMut(&S, i64) -> Result<Ordering>,
    {
        let root = self.root(store)?;
        if root == 0 {
            return Ok((Cursor::detached(self.clone()), false));
        }

        let mut page = self.open_page(store, root)?;
        loop {
            match page {
                Page::Index(x) => {
                    let (i, hit) = self.index_find(store, x, &mut cmp)?;
                    let child = self.child_at(store, x, if hit { i + 1 } else { i })?;
                    page = self.open_page(store, child)?;
                }
                Page::Leaf(d) => {
                    let (i, hit) = self.leaf_find(store, d, &mut cmp)?;
                    return Ok((Cursor::at(self.clone(), store, d, i, hit), hit));
                }
            }
        }
    }

    /// Returns a cursor positioned on the first item.
    pub fn seek_first<S: Storage + ?Sized>(&self, store: &S) -> Result<Cursor> {
        let first = self.first(store)?;
        if first == 0 {
            return Ok(Cursor::detached(self.clone()));
        }
        Ok(Cursor::at(self.clone(), store, LeafPage(first), 0, true))
    }

    /// Returns a cursor positioned on the last item.
    pub fn seek_last<S: Storage + ?Sized>(&self, store: &S) -> Result<Cursor> {
        let last = self.last(store)?;
        if last == 0 {
            return Ok(Cursor::detached(self.clone()));
        }
        let mut c = Cursor::at(self.clone(), store, LeafPage(last), 0, true);
        c.index = c.count as i64 - 1;
        Ok(c)
    }
}
