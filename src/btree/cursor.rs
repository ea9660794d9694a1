//! # Leaf-Chain Cursor
//!
//! A cursor walks the doubly-linked leaf chain item by item. Its state is a
//! leaf offset, that leaf's item count, the current slot index, and the two
//! flags that give the first move its seek-relative meaning:
//!
//! - after a seek **hit**, the first `next` and the first `prev` both yield
//!   the found item itself;
//! - after a seek **miss** the cursor sits at the insertion position, so the
//!   first `next` yields the strict successor and the first `prev` the
//!   strict predecessor.
//!
//! Every use of `k_off`/`v_off`, including the first, must be preceded by a
//! successful `next` or `prev`.
//!
//! A storage error during a move is captured on the cursor: the failing and
//! all subsequent moves return `false` and [`Cursor::err`] reports the
//! cause. Mutating the tree between moves invalidates the cursor; no
//! detection is attempted.

use eyre::Report;

use super::{BTree, LeafPage};
use crate::storage::Storage;

/// A stateful iterator over the items of one tree, created by
/// [`BTree::seek`], [`BTree::seek_first`], or [`BTree::seek_last`].
#[derive(Debug)]
pub struct Cursor {
    tree: BTree,
    /// Current leaf offset; 0 when the cursor is past either end or the
    /// tree was empty at seek time.
    page: i64,
    pub(crate) count: usize,
    pub(crate) index: i64,
    k: i64,
    v: i64,
    hit: bool,
    has_moved: bool,
    err: Option<Report>,
}

impl Cursor {
    /// A cursor over an empty tree; every move returns `false`.
    pub(crate) fn detached(tree: BTree) -> Cursor {
        Cursor {
            tree,
            page: 0,
            count: 0,
            index: 0,
            k: 0,
            v: 0,
            hit: false,
            has_moved: false,
            err: None,
        }
    }

    /// A cursor parked on slot `i` of leaf `d`. A failure reading the leaf
    /// count is captured as the cursor error.
    pub(crate) fn at<S: Storage + ?Sized>(
        tree: BTree,
        store: &S,
        d: LeafPage,
        i: usize,
        hit: bool,
    ) -> Cursor {
        let (count, err) = match tree.leaf_count(store, d) {
            Ok(c) => (c, None),
            Err(e) => (0, Some(e)),
        };
        Cursor {
            tree,
            page: d.0,
            count,
            index: i as i64,
            k: 0,
            v: 0,
            hit,
            has_moved: false,
            err,
        }
    }

    /// Offset of the current item's key slot.
    pub fn k_off(&self) -> i64 {
        self.k
    }

    /// Offset of the current item's value slot.
    pub fn v_off(&self) -> i64 {
        self.v
    }

    /// The error that stopped iteration, if any.
    pub fn err(&self) -> Option<&Report> {
        self.err.as_ref()
    }

    fn park(&mut self) {
        let d = LeafPage(self.page);
        self.k = self.tree.key_off(d, self.index as usize);
        self.v = self.tree.val_off(d, self.index as usize);
    }

    /// Moves to the next item and returns `true` on success. Returns
    /// `false` past the last item or on a storage error (see
    /// [`Cursor::err`]).
    pub fn next<S: Storage + ?Sized>(&mut self, store: &S) -> bool {
        if self.err.is_some() || self.page == 0 {
            return false;
        }

        if self.has_moved {
            self.index += 1;
        }
        self.has_moved = true;

        if self.index < self.count as i64 {
            self.park();
            return true;
        }

        match self.tree.leaf_next(store, LeafPage(self.page)) {
            Ok(next) => self.page = next,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        }
        if self.page == 0 {
            return false;
        }

        match self.tree.leaf_count(store, LeafPage(self.page)) {
            Ok(c) => self.count = c,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        }
        self.index = 0;
        self.park();
        true
    }

    /// Moves to the previous item and returns `true` on success. Returns
    /// `false` before the first item or on a storage error (see
    /// [`Cursor::err`]).
    pub fn prev<S: Storage + ?Sized>(&mut self, store: &S) -> bool {
        if self.err.is_some() || self.page == 0 {
            return false;
        }

        // a seek miss parks past the sought key, so the first step back
        // must skip nothing only on a hit
        if self.has_moved || !self.hit {
            self.index -= 1;
        }
        self.has_moved = true;

        if self.index >= 0 {
            self.park();
            return true;
        }

        match self.tree.leaf_prev(store, LeafPage(self.page)) {
            Ok(prev) => self.page = prev,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        }
        if self.page == 0 {
            return false;
        }

        match self.tree.leaf_count(store, LeafPage(self.page)) {
            Ok(c) => self.count = c,
            Err(e) => {
                self.err = Some(e);
                return false;
            }
        }
        self.index = self.count as i64 - 1;
        self.park();
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::btree::testutil::*;
    use crate::btree::{BTree, Cursor};
    use crate::storage::MemStore;

    fn five_key_tree(store: &mut MemStore) -> BTree {
        // kd = 1, kx = 2: five items span several leaves
        let t = int_tree(store, 2, 4);
        for k in [10, 20, 30, 40, 50] {
            set_int(&t, store, k, 10 * k);
        }
        t
    }

    fn drain_next(c: &mut Cursor, store: &MemStore) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        while c.next(store) {
            out.push((key_at(store, c.k_off()), val_at(store, c.v_off())));
        }
        assert!(c.err().is_none());
        out
    }

    fn drain_prev(c: &mut Cursor, store: &MemStore) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        while c.prev(store) {
            out.push((key_at(store, c.k_off()), val_at(store, c.v_off())));
        }
        assert!(c.err().is_none());
        out
    }

    #[test]
    fn seek_then_next_walks_tail() {
        let table: [(i32, bool, &[i32]); 11] = [
            (5, false, &[10, 20, 30, 40, 50]),
            (10, true, &[10, 20, 30, 40, 50]),
            (15, false, &[20, 30, 40, 50]),
            (20, true, &[20, 30, 40, 50]),
            (25, false, &[30, 40, 50]),
            (30, true, &[30, 40, 50]),
            (35, false, &[40, 50]),
            (40, true, &[40, 50]),
            (45, false, &[50]),
            (50, true, &[50]),
            (55, false, &[]),
        ];

        for (k, want_hit, want_keys) in table {
            let mut store = MemStore::new();
            let t = five_key_tree(&mut store);

            let (mut c, hit) = t.seek(&store, cmp_int(k)).unwrap();
            assert_eq!(hit, want_hit, "seek {}", k);

            let got = drain_next(&mut c, &store);
            let want: Vec<(i32, i32)> = want_keys.iter().map(|&k| (k, 10 * k)).collect();
            assert_eq!(got, want, "seek {}", k);

            remove_int(t, &mut store);
        }
    }

    #[test]
    fn seek_then_prev_walks_head() {
        let table: [(i32, bool, &[i32]); 11] = [
            (5, false, &[]),
            (10, true, &[10]),
            (15, false, &[10]),
            (20, true, &[20, 10]),
            (25, false, &[20, 10]),
            (30, true, &[30, 20, 10]),
            (35, false, &[30, 20, 10]),
            (40, true, &[40, 30, 20, 10]),
            (45, false, &[40, 30, 20, 10]),
            (50, true, &[50, 40, 30, 20, 10]),
            (55, false, &[50, 40, 30, 20, 10]),
        ];

        for (k, want_hit, want_keys) in table {
            let mut store = MemStore::new();
            let t = five_key_tree(&mut store);

            let (mut c, hit) = t.seek(&store, cmp_int(k)).unwrap();
            assert_eq!(hit, want_hit, "seek {}", k);

            let got = drain_prev(&mut c, &store);
            let want: Vec<(i32, i32)> = want_keys.iter().map(|&k| (k, 10 * k)).collect();
            assert_eq!(got, want, "seek {}", k);

            remove_int(t, &mut store);
        }
    }

    #[test]
    fn seek_hit_is_replayable_in_both_directions() {
        let mut store = MemStore::new();
        let t = five_key_tree(&mut store);

        let (mut c, hit) = t.seek(&store, cmp_int(30)).unwrap();
        assert!(hit);
        assert_eq!(drain_prev(&mut c, &store), [(30, 300), (20, 200), (10, 100)]);

        let (mut c, _) = t.seek(&store, cmp_int(30)).unwrap();
        assert_eq!(drain_next(&mut c, &store), [(30, 300), (40, 400), (50, 500)]);

        remove_int(t, &mut store);
    }

    #[test]
    fn seek_first_walks_forward_and_yields_first_backward() {
        for n in 0..10 {
            let mut store = MemStore::new();
            let t = int_tree(&mut store, 2, 4);
            for j in 0..n {
                set_int(&t, &mut store, 10 * j, 100 * j);
            }

            if n == 0 {
                let mut c = t.seek_first(&store).unwrap();
                assert!(!c.prev(&store));
                let mut c = t.seek_first(&store).unwrap();
                assert!(!c.next(&store));
            } else {
                // the first prev after seek_first yields the first item
                let mut c = t.seek_first(&store).unwrap();
                assert!(c.prev(&store));
                assert_eq!(key_at(&store, c.k_off()), 0);
                assert!(!c.prev(&store));

                let mut c = t.seek_first(&store).unwrap();
                let got = drain_next(&mut c, &store);
                let want: Vec<(i32, i32)> = (0..n).map(|j| (10 * j, 100 * j)).collect();
                assert_eq!(got, want);
            }

            remove_int(t, &mut store);
        }
    }

    #[test]
    fn seek_last_walks_backward_and_yields_last_forward() {
        for n in 0..10 {
            let mut store = MemStore::new();
            let t = int_tree(&mut store, 2, 4);
            for j in 0..n {
                set_int(&t, &mut store, 10 * j, 100 * j);
            }

            if n == 0 {
                let mut c = t.seek_last(&store).unwrap();
                assert!(!c.prev(&store));
                let mut c = t.seek_last(&store).unwrap();
                assert!(!c.next(&store));
            } else {
                // the first next after seek_last yields the last item
                let mut c = t.seek_last(&store).unwrap();
                assert!(c.next(&store));
                assert_eq!(key_at(&store, c.k_off()), 10 * (n - 1));
                assert!(!c.next(&store));

                let mut c = t.seek_last(&store).unwrap();
                let got = drain_prev(&mut c, &store);
                let want: Vec<(i32, i32)> =
                    (0..n).rev().map(|j| (10 * j, 100 * j)).collect();
                assert_eq!(got, want);
            }

            remove_int(t, &mut store);
        }
    }

    #[test]
    fn seek_miss_walks_every_tail() {
        const N: i32 = 1 << 8;
        let mut store = MemStore::new();
        let t = int_tree(&mut store, 16, 16);

        for i in 0..N {
            set_int(&t, &mut store, 2 * i + 1, 0);
        }

        for i in 0..N {
            let (mut c, hit) = t.seek(&store, cmp_int(2 * i)).unwrap();
            assert!(!hit);

            for j in i..N {
                assert!(c.next(&store), "seek {} stalled at {}", 2 * i, j);
                assert_eq!(key_at(&store, c.k_off()), 2 * j + 1);
            }
            assert!(!c.next(&store));
        }

        remove_int(t, &mut store);
    }
}
