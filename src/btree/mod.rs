//! # B+Tree Over Offset-Addressed Pages
//!
//! This module implements the tree itself: a 64-byte header block, leaf
//! pages chained into a doubly-linked list, and index pages holding
//! separator/child pairs. Every structure is addressed by its storage
//! offset; a "page handle" is nothing but a typed offset, cheap to copy and
//! never caching decoded page state across operations.
//!
//! ## Page Kinds
//!
//! Two page kinds share a 4-byte tag word at offset 0:
//!
//! - **Leaf pages** (tag 0) store the items. A leaf holds up to `2*kd`
//!   live items plus one overflow slot so that insertion-before-split is
//!   always in bounds, and carries `prev`/`next` offsets forming the ordered
//!   leaf chain.
//! - **Index pages** (tag 1) store separator/child pairs. A separator is the
//!   offset of a key slot inside some leaf - not a copy of the key bytes -
//!   so separators resolve through the same comparator callback as leaf
//!   keys and track leaf-local shifts for free.
//!
//! ## Page Layout
//!
//! ```text
//! Leaf (32 + (2*kd+1)*(szKey+szVal) bytes):
//! +--------+--------+--------+--------+--------+------------------------+
//! | tag: 0 |  pad   | count  |  pad   | prev 8 | next 8 | items ...     |
//! +--------+--------+--------+--------+--------+------------------------+
//!     4        4        4        4
//!
//! Index (16 + (2*kx+2)*16 bytes):
//! +--------+--------+--------+--------+-------------------------------+
//! | tag: 1 |  pad   | count  |  pad   | (child 8, key 8) slots ...    |
//! +--------+--------+--------+--------+-------------------------------+
//! ```
//!
//! An index page with `count` separators has `count + 1` children; the key
//! half of slot `count` is the right-open sentinel and is never read.
//!
//! ## Balancing Discipline
//!
//! Mutations are top-down and preventive. [`BTree::set`] splits any full
//! index page while descending, so a leaf split always finds room in its
//! parent. [`BTree::delete`] rotates or merges any index page that is about
//! to drop below `kx` before descending through it, so a leaf merge never
//! finds an underfull parent. `kd` and `kx` are the half-capacities fixed at
//! [`BTree::create`] time and recorded in the header.
//!
//! ## Callbacks
//!
//! The tree never interprets key or value bytes. Searches take a comparator
//! receiving the offset of a stored key slot; comparators get shared storage
//! access only and must not mutate the tree. Removal operations accept an
//! optional per-item free callback receiving both slot offsets, giving the
//! caller a chance to release out-of-band payloads; `set` accepts a
//! value-slot-only callback invoked when overwriting an existing key.

mod cursor;
mod interior;
mod leaf;
mod tree;

pub use cursor::Cursor;

use eyre::Result;

/// Tag word of a leaf page.
pub(crate) const TAG_LEAF: i32 = 0;
/// Tag word of an index page.
pub(crate) const TAG_INDEX: i32 = 1;

/// Fanout used when `create` is passed 0 for `nd` or `nx`.
pub(crate) const DEFAULT_FANOUT: usize = 256;

/// Per-item free callback: receives the key and value slot offsets of an
/// item being removed from the tree.
pub type FreeItem<'a, S> = &'a mut dyn FnMut(&mut S, i64, i64) -> Result<()>;

/// Overwrite free callback: receives the value slot offset of an existing
/// item whose value is about to be replaced. The key slot is never freed on
/// overwrite.
pub type FreeVal<'a, S> = &'a mut dyn FnMut(&mut S, i64) -> Result<()>;

/// Handle to a B+tree stored at a fixed header offset.
///
/// The handle caches only the immutable tree parameters read from the
/// header at `create`/`open` time; all mutable state (root, length, leaf
/// chain ends) is read from storage on demand.
#[derive(Clone, Debug)]
pub struct BTree {
    pub(crate) off: i64,
    pub(crate) sz_key: i64,
    pub(crate) sz_val: i64,
    pub(crate) kd: usize,
    pub(crate) kx: usize,
}

/// A leaf page handle: just the page offset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct LeafPage(pub(crate) i64);

/// An index page handle: just the page offset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct IndexPage(pub(crate) i64);

/// A page of either kind, discriminated by the tag word read once at
/// [`BTree::open_page`].
#[derive(Clone, Copy, Debug)]
pub(crate) enum Page {
    Leaf(LeafPage),
    Index(IndexPage),
}
