//! Black-box scenarios over `MemStore`: the tree is driven purely through
//! its public surface, with integer keys and values stored behind per-item
//! payload blobs the way an embedding database engine would use it. Most
//! scenarios bracket the storage size to prove that `remove` returns every
//! byte the tree and its payloads consumed.

use std::cmp::Ordering;

use eyre::Result;
use treeline::storage::{read_i32, read_i64, write_i32, write_i64};
use treeline::{BTree, MemStore, Storage};

fn cmp_int(n: i32) -> impl FnMut(&MemStore, i64) -> Result<Ordering> {
    move |store, koff| {
        let blob = read_i64(store, koff)?;
        let m = read_i32(store, blob)?;
        Ok(n.cmp(&m))
    }
}

fn set_int(tree: &BTree, store: &mut MemStore, k: i32, v: i32) {
    let mut fresh_key = true;
    let (koff, voff) = {
        let mut free_val = |s: &mut MemStore, voff: i64| -> Result<()> {
            let blob = read_i64(s, voff)?;
            fresh_key = false;
            s.free(blob)
        };
        tree.set(store, cmp_int(k), Some(&mut free_val)).unwrap()
    };

    if fresh_key {
        let kb = store.alloc(4).unwrap();
        write_i32(store, kb, k).unwrap();
        write_i64(store, koff, kb).unwrap();
    }

    let vb = store.alloc(4).unwrap();
    write_i32(store, vb, v).unwrap();
    write_i64(store, voff, vb).unwrap();
}

fn get_int(tree: &BTree, store: &MemStore, k: i32) -> Option<i32> {
    let voff = tree.get(store, cmp_int(k)).unwrap()?;
    let blob = read_i64(store, voff).unwrap();
    Some(read_i32(store, blob).unwrap())
}

fn free_item(store: &mut MemStore, koff: i64, voff: i64) -> Result<()> {
    let kb = read_i64(store, koff)?;
    store.free(kb)?;
    let vb = read_i64(store, voff)?;
    store.free(vb)
}

fn delete_int(tree: &BTree, store: &mut MemStore, k: i32) -> bool {
    let mut free = free_item;
    tree.delete(store, cmp_int(k), Some(&mut free)).unwrap()
}

fn remove_tree(tree: BTree, store: &mut MemStore) {
    let mut free = free_item;
    tree.remove(store, Some(&mut free)).unwrap()
}

const MIXERS: [i32; 8] = [
    0,
    -1,
    0x0555_5555,
    0x0AAA_AAAA,
    0x0333_3333,
    0x0CCC_CCCC,
    0x3141_5926,
    0x0271_8282,
];

#[test]
fn empty_tree_get_misses() {
    let mut store = MemStore::new();
    let base = store.size().unwrap();

    let tree = BTree::create(&mut store, 8, 8, 16, 16).unwrap();
    assert_eq!(tree.len(&store).unwrap(), 0);
    assert_eq!(get_int(&tree, &store, 42), None);

    remove_tree(tree, &mut store);
    assert_eq!(store.size().unwrap(), base, "storage leak");
}

#[test]
fn set_overwrite_and_second_key() {
    let mut store = MemStore::new();
    let base = store.size().unwrap();
    let tree = BTree::create(&mut store, 8, 8, 16, 16).unwrap();

    set_int(&tree, &mut store, 42, 314);
    assert_eq!(tree.len(&store).unwrap(), 1);
    assert_eq!(get_int(&tree, &store, 42), Some(314));

    set_int(&tree, &mut store, 42, 278);
    assert_eq!(tree.len(&store).unwrap(), 1);

    set_int(&tree, &mut store, 420, 5);
    assert_eq!(tree.len(&store).unwrap(), 2);
    assert_eq!(get_int(&tree, &store, 42), Some(278));
    assert_eq!(get_int(&tree, &store, 420), Some(5));

    remove_tree(tree, &mut store);
    assert_eq!(store.size().unwrap(), base, "storage leak");
}

#[test]
fn shuffled_bulk_insert_then_lookup() {
    const N: i32 = 1 << 10;
    for &x in &MIXERS {
        let mut store = MemStore::new();
        let base = store.size().unwrap();
        let tree = BTree::create(&mut store, 8, 8, 16, 16).unwrap();

        let keys: Vec<i32> = (0..N).map(|i| (i ^ x) << 1).collect();
        for (i, &k) in keys.iter().enumerate() {
            set_int(&tree, &mut store, k, k ^ x);
            assert_eq!(tree.len(&store).unwrap(), i as i64 + 1, "mixer {:#x}", x);
        }

        for &k in &keys {
            assert_eq!(get_int(&tree, &store, k), Some(k ^ x), "mixer {:#x}", x);
            // odd neighbors were never inserted
            assert_eq!(get_int(&tree, &store, k | 1), None, "mixer {:#x}", x);
        }

        remove_tree(tree, &mut store);
        assert_eq!(store.size().unwrap(), base, "storage leak, mixer {:#x}", x);
    }
}

#[test]
fn bulk_delete_in_insertion_order_drains_tree() {
    const N: i32 = 1 << 11;
    for &x in &MIXERS {
        let mut store = MemStore::new();
        let base = store.size().unwrap();
        let tree = BTree::create(&mut store, 8, 8, 16, 16).unwrap();

        let keys: Vec<i32> = (0..N).map(|i| (i ^ x) << 1).collect();
        for &k in &keys {
            set_int(&tree, &mut store, k, 0);
        }

        for (i, &k) in keys.iter().enumerate() {
            assert!(delete_int(&tree, &mut store, k), "mixer {:#x} key {}", x, k);
            assert!(!delete_int(&tree, &mut store, k), "double delete {}", k);
            assert_eq!(tree.len(&store).unwrap(), (N - i as i32 - 1) as i64);
        }

        assert_eq!(tree.len(&store).unwrap(), 0);
        remove_tree(tree, &mut store);
        assert_eq!(store.size().unwrap(), base, "storage leak, mixer {:#x}", x);
    }
}

#[test]
fn cursor_walks_around_leaf_boundaries() {
    let mut store = MemStore::new();
    let tree = BTree::create(&mut store, 8, 8, 2, 4).unwrap();
    for k in [10, 20, 30, 40, 50] {
        set_int(&tree, &mut store, k, 10 * k);
    }

    // miss below the first key: next yields everything
    let (mut c, hit) = tree.seek(&store, cmp_int(5)).unwrap();
    assert!(!hit);
    let mut seen = Vec::new();
    while c.next(&store) {
        let blob = read_i64(&store, c.k_off()).unwrap();
        seen.push(read_i32(&store, blob).unwrap());
    }
    assert!(c.err().is_none());
    assert_eq!(seen, [10, 20, 30, 40, 50]);

    // hit in the middle: prev replays the hit, then walks down
    let (mut c, hit) = tree.seek(&store, cmp_int(30)).unwrap();
    assert!(hit);
    let mut seen = Vec::new();
    while c.prev(&store) {
        let blob = read_i64(&store, c.k_off()).unwrap();
        seen.push(read_i32(&store, blob).unwrap());
    }
    assert_eq!(seen, [30, 20, 10]);

    // same hit forward
    let (mut c, _) = tree.seek(&store, cmp_int(30)).unwrap();
    let mut seen = Vec::new();
    while c.next(&store) {
        let blob = read_i64(&store, c.k_off()).unwrap();
        seen.push(read_i32(&store, blob).unwrap());
    }
    assert_eq!(seen, [30, 40, 50]);

    remove_tree(tree, &mut store);
}

#[test]
fn clear_frees_payloads_and_pages() {
    let mut store = MemStore::new();
    let base = store.size().unwrap();
    let tree = BTree::create(&mut store, 8, 8, 4, 4).unwrap();

    let mut freed = 0usize;
    for k in 0..500 {
        set_int(&tree, &mut store, k, k);
    }
    {
        let mut free = |s: &mut MemStore, koff: i64, voff: i64| -> Result<()> {
            freed += 1;
            free_item(s, koff, voff)
        };
        tree.clear(&mut store, Some(&mut free)).unwrap();
    }

    assert_eq!(freed, 500);
    assert_eq!(tree.len(&store).unwrap(), 0);
    assert_eq!(tree.first(&store).unwrap(), 0);
    assert_eq!(tree.last(&store).unwrap(), 0);

    // still usable after clear
    set_int(&tree, &mut store, 1, 2);
    assert_eq!(get_int(&tree, &store, 1), Some(2));

    remove_tree(tree, &mut store);
    assert_eq!(store.size().unwrap(), base, "storage leak");
}

#[test]
fn reopened_tree_serves_existing_items() {
    let mut store = MemStore::new();
    let tree = BTree::create(&mut store, 8, 8, 8, 8).unwrap();
    for k in 0..300 {
        set_int(&tree, &mut store, k, 7 * k);
    }
    store.set_root(tree.offset()).unwrap();
    let off = tree.offset();
    drop(tree);

    let handle = store.root().unwrap();
    assert_eq!(handle, off);
    let tree = BTree::open(&store, handle).unwrap();
    assert_eq!(tree.len(&store).unwrap(), 300);
    for k in 0..300 {
        assert_eq!(get_int(&tree, &store, k), Some(7 * k));
    }

    remove_tree(tree, &mut store);
}

#[test]
fn first_and_last_track_leaf_chain_ends() {
    let mut store = MemStore::new();
    let tree = BTree::create(&mut store, 8, 8, 2, 4).unwrap();

    assert_eq!(tree.first(&store).unwrap(), 0);
    assert_eq!(tree.last(&store).unwrap(), 0);

    set_int(&tree, &mut store, 1, 1);
    assert_eq!(tree.first(&store).unwrap(), tree.last(&store).unwrap());

    for k in 2..100 {
        set_int(&tree, &mut store, k, k);
    }
    assert_ne!(tree.first(&store).unwrap(), tree.last(&store).unwrap());

    // the cursor parked by seek_first sits on the first leaf
    let mut c = tree.seek_first(&store).unwrap();
    assert!(c.next(&store));
    let blob = read_i64(&store, c.k_off()).unwrap();
    assert_eq!(read_i32(&store, blob).unwrap(), 1);

    let mut c = tree.seek_last(&store).unwrap();
    assert!(c.next(&store));
    let blob = read_i64(&store, c.k_off()).unwrap();
    assert_eq!(read_i32(&store, blob).unwrap(), 99);

    remove_tree(tree, &mut store);
}

#[test]
fn descending_inserts_balance_out() {
    let mut store = MemStore::new();
    let base = store.size().unwrap();
    let tree = BTree::create(&mut store, 8, 8, 4, 4).unwrap();

    for k in (0..1000).rev() {
        set_int(&tree, &mut store, k, k + 1);
    }
    assert_eq!(tree.len(&store).unwrap(), 1000);

    for k in 0..1000 {
        assert_eq!(get_int(&tree, &store, k), Some(k + 1));
    }

    remove_tree(tree, &mut store);
    assert_eq!(store.size().unwrap(), base, "storage leak");
}

#[test]
fn two_trees_coexist_in_one_store() {
    let mut store = MemStore::new();
    let base = store.size().unwrap();

    let a = BTree::create(&mut store, 8, 8, 8, 8).unwrap();
    let b = BTree::create(&mut store, 8, 8, 2, 4).unwrap();

    for k in 0..150 {
        set_int(&a, &mut store, k, k);
        set_int(&b, &mut store, k, 1000 + k);
    }

    remove_tree(a, &mut store);

    for k in 0..150 {
        assert_eq!(get_int(&b, &store, k), Some(1000 + k));
    }

    remove_tree(b, &mut store);
    assert_eq!(store.size().unwrap(), base, "storage leak");
}
