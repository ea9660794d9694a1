//! # Storage Adapter Contract
//!
//! The tree consumes a byte-addressable store with an allocator; it never
//! implements one. Every persistent structure in this crate - the tree
//! header, leaf pages, index pages - lives in regions obtained from
//! [`Storage::alloc`] and is manipulated exclusively through offset-in,
//! bytes-in/out calls. The adapter is free to back those bytes with a
//! page-backed file, a memory-mapped region, or a plain in-memory buffer
//! (see [`MemStore`]).
//!
//! ## Field Helpers
//!
//! All multi-byte integers on storage are big-endian two's complement. The
//! helpers in this module ([`read_i64`], [`write_i64`], [`read_i32`],
//! [`write_i32`]) encode single header fields and synthesize an error when
//! the adapter returns a short read or write without one, so the tree code
//! above never has to reason about partial I/O.
//!
//! ## Error Handling
//!
//! Adapter failures propagate unchanged. No call is retried; retries, if
//! appropriate, are the caller's responsibility.

mod mem;

pub use mem::MemStore;

use eyre::{ensure, Result};

/// A byte-addressable backing store with an allocator.
///
/// Offsets are 64-bit and signed; offset 0 is reserved as the null offset
/// and is never returned by `alloc`. A written byte is visible to subsequent
/// reads within the same session; durability is the adapter's business
/// (`sync`).
pub trait Storage {
    /// Allocates a block of at least `size` bytes and returns its offset.
    /// The offset is 8-byte aligned and the contents are undefined.
    fn alloc(&mut self, size: i64) -> Result<i64>;

    /// As [`Storage::alloc`], but the block is zeroed up to `size`.
    fn calloc(&mut self, size: i64) -> Result<i64>;

    /// Recycles the block at `off`, which must have come from `alloc`,
    /// `calloc`, or `realloc`.
    fn free(&mut self, off: i64) -> Result<()>;

    /// Resizes the block at `off` to `size` bytes and returns its possibly
    /// relocated offset. Contents are preserved up to the minimum of the old
    /// and new sizes. `realloc(off, 0)` is equal to `free(off)`.
    fn realloc(&mut self, off: i64, size: i64) -> Result<i64>;

    /// Reads up to `buf.len()` bytes starting at `off` and returns the
    /// number of bytes read. A short count without an error means end of
    /// storage.
    fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize>;

    /// Writes `buf` at `off` and returns the number of bytes written. The
    /// adapter must report an error when fewer than `buf.len()` bytes were
    /// written.
    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize>;

    /// Returns the persisted root object offset, or 0 when none was set.
    fn root(&self) -> Result<i64>;

    /// Persists the root object offset.
    fn set_root(&mut self, root: i64) -> Result<()>;

    /// Returns the total storage size in bytes.
    fn size(&self) -> Result<i64>;

    /// Commits current contents to stable storage.
    fn sync(&mut self) -> Result<()>;

    /// Changes the storage size.
    fn truncate(&mut self, size: i64) -> Result<()>;

    /// Finishes storage use.
    fn close(&mut self) -> Result<()>;
}

/// Fills `buf` from `off`, converting a short read into an error.
pub fn read_exact<S: Storage + ?Sized>(store: &S, buf: &mut [u8], off: i64) -> Result<()> {
    let n = store.read_at(buf, off)?;
    ensure!(
        n == buf.len(),
        "short storage read: {} of {} bytes at offset {}",
        n,
        buf.len(),
        off
    );
    Ok(())
}

/// Writes all of `buf` at `off`, converting a short write into an error.
pub fn write_all<S: Storage + ?Sized>(store: &mut S, buf: &[u8], off: i64) -> Result<()> {
    let n = store.write_at(buf, off)?;
    ensure!(
        n == buf.len(),
        "short storage write: {} of {} bytes at offset {}",
        n,
        buf.len(),
        off
    );
    Ok(())
}

/// Reads a big-endian i64 field at `off`.
pub fn read_i64<S: Storage + ?Sized>(store: &S, off: i64) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact(store, &mut buf, off)?;
    Ok(i64::from_be_bytes(buf))
}

/// Writes a big-endian i64 field at `off`.
pub fn write_i64<S: Storage + ?Sized>(store: &mut S, off: i64, n: i64) -> Result<()> {
    write_all(store, &n.to_be_bytes(), off)
}

/// Reads a big-endian i32 field at `off`.
pub fn read_i32<S: Storage + ?Sized>(store: &S, off: i64) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(store, &mut buf, off)?;
    Ok(i32::from_be_bytes(buf))
}

/// Writes a big-endian i32 field at `off`.
pub fn write_i32<S: Storage + ?Sized>(store: &mut S, off: i64, n: i32) -> Result<()> {
    write_all(store, &n.to_be_bytes(), off)
}
