//! # In-Memory Storage Adapter
//!
//! `MemStore` backs the [`Storage`] contract with a single growable byte
//! buffer. It exists for tests and for embedders that want tree semantics
//! without a file, and it is deliberately simple: bump allocation at the end
//! of the buffer, an exact-size recycler for freed blocks, and truncation of
//! trailing free space so that a store whose every block has been freed
//! shrinks back to its baseline size. That last property is what lets the
//! test suite assert the tree leaks nothing by bracketing `size()`.
//!
//! ## Layout
//!
//! ```text
//! offset 0        BASE                                    buf.len()
//! |  reserved     |  block | pad | block | pad | block ...|
//! ```
//!
//! The first `BASE` bytes are reserved so no allocation is ever handed out
//! at offset 0, which the tree treats as the null offset. Every block starts
//! on an 8-byte boundary.

use std::collections::BTreeMap;

use eyre::{bail, ensure, Result};

use super::Storage;

/// Reserved prefix; keeps offset 0 (the null offset) out of circulation.
const BASE: i64 = 16;

fn align8(n: i64) -> i64 {
    (n + 7) & !7
}

/// An in-memory [`Storage`] implementation.
#[derive(Debug)]
pub struct MemStore {
    buf: Vec<u8>,
    /// Live blocks, offset -> size.
    live: BTreeMap<i64, i64>,
    /// Freed blocks awaiting reuse or tail truncation, offset -> size.
    freed: BTreeMap<i64, i64>,
    /// Recycler index over `freed`, size -> offsets.
    by_size: BTreeMap<i64, Vec<i64>>,
    root: i64,
    closed: bool,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            buf: vec![0; BASE as usize],
            live: BTreeMap::new(),
            freed: BTreeMap::new(),
            by_size: BTreeMap::new(),
            root: 0,
            closed: false,
        }
    }

    /// Number of blocks currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Removes trailing freed blocks and shrinks the buffer over them.
    fn shrink_tail(&mut self) {
        while let Some((&off, &size)) = self.freed.last_key_value() {
            if align8(off + size) < self.buf.len() as i64 {
                break;
            }

            self.freed.remove(&off);
            if let Some(offs) = self.by_size.get_mut(&size) {
                offs.retain(|&o| o != off);
                if offs.is_empty() {
                    self.by_size.remove(&size);
                }
            }
            self.buf.truncate(off as usize);
        }
    }

    fn check_open(&self) -> Result<()> {
        ensure!(!self.closed, "storage is closed");
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStore {
    fn alloc(&mut self, size: i64) -> Result<i64> {
        self.check_open()?;
        ensure!(size >= 0, "invalid allocation size {}", size);
        // zero-sized blocks still need distinct offsets
        let size = size.max(1);

        if let Some(offs) = self.by_size.get_mut(&size) {
            if let Some(off) = offs.pop() {
                if offs.is_empty() {
                    self.by_size.remove(&size);
                }
                self.freed.remove(&off);
                self.live.insert(off, size);
                return Ok(off);
            }
        }

        let off = align8(self.buf.len() as i64);
        self.buf.resize((off + size) as usize, 0);
        self.live.insert(off, size);
        Ok(off)
    }

    fn calloc(&mut self, size: i64) -> Result<i64> {
        let off = self.alloc(size)?;
        // recycled blocks carry stale bytes
        self.buf[off as usize..(off + size) as usize].fill(0);
        Ok(off)
    }

    fn free(&mut self, off: i64) -> Result<()> {
        self.check_open()?;
        let Some(size) = self.live.remove(&off) else {
            bail!("free of unallocated offset {}", off);
        };

        self.freed.insert(off, size);
        self.by_size.entry(size).or_default().push(off);
        self.shrink_tail();
        Ok(())
    }

    fn realloc(&mut self, off: i64, size: i64) -> Result<i64> {
        self.check_open()?;
        if size == 0 {
            self.free(off)?;
            return Ok(0);
        }

        let Some(&old) = self.live.get(&off) else {
            bail!("realloc of unallocated offset {}", off);
        };
        if old == size {
            return Ok(off);
        }

        let new = self.alloc(size)?;
        let n = old.min(size) as usize;
        self.buf.copy_within(off as usize..off as usize + n, new as usize);
        self.free(off)?;
        Ok(new)
    }

    fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize> {
        self.check_open()?;
        ensure!(off >= 0, "invalid read offset {}", off);

        let off = off as usize;
        if off >= self.buf.len() {
            return Ok(0);
        }

        let n = buf.len().min(self.buf.len() - off);
        buf[..n].copy_from_slice(&self.buf[off..off + n]);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize> {
        self.check_open()?;
        ensure!(off >= 0, "invalid write offset {}", off);

        let end = off as usize + buf.len();
        ensure!(
            end <= self.buf.len(),
            "write beyond storage end: offset {} len {} size {}",
            off,
            buf.len(),
            self.buf.len()
        );

        self.buf[off as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn root(&self) -> Result<i64> {
        self.check_open()?;
        Ok(self.root)
    }

    fn set_root(&mut self, root: i64) -> Result<()> {
        self.check_open()?;
        self.root = root;
        Ok(())
    }

    fn size(&self) -> Result<i64> {
        self.check_open()?;
        Ok(self.buf.len() as i64)
    }

    fn sync(&mut self) -> Result<()> {
        self.check_open()
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        self.check_open()?;
        ensure!(size >= 0, "invalid truncate size {}", size);
        self.buf.resize(size as usize, 0);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        self.buf = Vec::new();
        self.live.clear();
        self.freed.clear();
        self.by_size.clear();
        Ok(())
    }
}
