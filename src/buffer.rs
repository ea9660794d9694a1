//! # Scratch Buffer Pool
//!
//! Slot-range copies inside pages stage their bytes through a transient
//! buffer: read the source range into scratch, write it back out at the
//! destination. Those buffers are recycled through a process-wide pool so
//! that steady-state tree mutations allocate nothing.
//!
//! Acquisition is scoped: [`acquire`] hands out a [`Scratch`] guard whose
//! `Drop` returns the buffer to the pool, so the buffer is released on every
//! exit path, including early returns on storage errors.

use std::mem;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Upper bound on buffers retained by the pool.
const MAX_POOLED: usize = 16;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// A pooled byte buffer, returned to the pool on drop.
pub struct Scratch {
    buf: Vec<u8>,
}

/// Acquires a zero-initialized scratch buffer of exactly `len` bytes.
pub fn acquire(len: usize) -> Scratch {
    let mut buf = POOL.lock().pop().unwrap_or_default();
    buf.clear();
    buf.resize(len, 0);
    Scratch { buf }
}

impl Deref for Scratch {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let buf = mem::take(&mut self.buf);
        let mut pool = POOL.lock();
        if pool.len() < MAX_POOLED {
            pool.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_requested_length() {
        let s = acquire(100);
        assert_eq!(s.len(), 100);
    }

    #[test]
    fn acquire_zero_length() {
        let s = acquire(0);
        assert!(s.is_empty());
    }

    #[test]
    fn scratch_is_zeroed() {
        {
            let mut s = acquire(64);
            s[..64].fill(0xAB);
        }
        let s = acquire(64);
        assert!(s.iter().all(|&b| b == 0));
    }

    #[test]
    fn scratch_is_writable() {
        let mut s = acquire(8);
        s.copy_from_slice(&42i64.to_be_bytes());
        assert_eq!(i64::from_be_bytes(s[..8].try_into().unwrap()), 42);
    }
}
