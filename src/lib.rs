//! # Treeline - B+Tree Index Over Offset-Addressed Storage
//!
//! Treeline is the index component that sits beneath a database engine. It
//! stores ordered key/value associations inside a byte-addressable backing
//! store and owns no file of its own: every page read and write goes through
//! a caller-supplied [`Storage`] adapter that hands out variable-length byte
//! regions identified by 64-bit offsets.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Tree operations (get/set/delete)   │
//! ├──────────────────────────────────────┤
//! │   Leaf + index page primitives       │
//! ├──────────────────────────────────────┤
//! │   Storage adapter (alloc/read/write) │  <- supplied by the caller
//! └──────────────────────────────────────┘
//! ```
//!
//! There is no in-memory node cache and there are no in-memory pointers
//! between nodes. A tree is a 64-byte header block plus leaf and index pages,
//! all addressed by offset; the classic pointer-based B+tree algorithms are
//! expressed entirely in terms of offset arithmetic, byte-packed records, and
//! explicit allocator calls.
//!
//! ## Keys and Values
//!
//! Keys and values are fixed-width slots, configured per tree (possibly zero
//! bytes wide). The tree never interprets slot contents: searches go through
//! a caller-supplied comparator that receives the offset of a stored key
//! slot. Callers typically store offsets to caller-owned payload blobs in the
//! slots, which is why removal operations accept free callbacks that receive
//! the slot offsets of each removed item.
//!
//! ## Module Overview
//!
//! - [`storage`]: the `Storage` adapter contract, big-endian field helpers,
//!   and `MemStore`, an in-memory adapter
//! - [`btree`]: tree handle, page algorithms, and the leaf-chain cursor
//! - [`buffer`]: process-wide scratch buffer pool used by slot-range copies
//!
//! ## Concurrency
//!
//! A tree is single-threaded: no internal synchronization, undefined behavior
//! on concurrent use of one tree handle. Callers needing shared access wrap
//! the store and handle in their own lock.

pub mod btree;
pub mod buffer;
pub mod storage;

pub use btree::{BTree, Cursor, FreeItem, FreeVal};
pub use storage::{MemStore, Storage};
