//! AVL balance invariants under randomized insertion and deletion, and
//! in-order cursor behavior.

use hivestore::{Error, Key, NodeId, Order, Store, SubTree};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tempfile::TempDir;

fn new_store(dir: &TempDir) -> Store {
    Store::options()
        .create(true)
        .cache_kb(1024)
        .open(dir.path().join("avl.hive"))
        .unwrap()
}

fn collect_names(store: &Store, parent: NodeId, tree: SubTree, order: Order) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = store.cursor(tree, order);
    let mut node = cursor.first(parent, None);
    while let Ok(id) = node {
        names.push(String::from_utf8(store.get_name(id).unwrap()).unwrap());
        node = cursor.next();
    }
    assert!(matches!(node, Err(Error::NotFound)));
    names
}

#[test]
fn thousand_random_insertions_stay_balanced() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let mut names: Vec<String> = (0..1000).map(|n| n.to_string()).collect();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    names.shuffle(&mut rng);

    for (i, name) in names.iter().enumerate() {
        store
            .create_key(NodeId::ROOT, &Key::new(name.as_bytes()))
            .unwrap();
        if (i + 1) % 100 == 0 {
            store.verify_tree(NodeId::ROOT, SubTree::Keys).unwrap();
        }
    }

    let mut expected = names.clone();
    expected.sort();
    assert_eq!(
        collect_names(&store, NodeId::ROOT, SubTree::Keys, Order::Ascending),
        expected
    );

    expected.reverse();
    assert_eq!(
        collect_names(&store, NodeId::ROOT, SubTree::Keys, Order::Descending),
        expected
    );
    assert!(store.cache_consistent());
}

#[test]
fn random_deletions_stay_balanced() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    let mut names: Vec<String> = (0..500).map(|n| format!("key{n:03}")).collect();
    let mut rng = StdRng::seed_from_u64(7);
    names.shuffle(&mut rng);
    for name in &names {
        store
            .create_key(NodeId::ROOT, &Key::new(name.as_bytes()))
            .unwrap();
    }

    names.shuffle(&mut rng);
    let (gone, kept) = names.split_at(250);
    for (i, name) in gone.iter().enumerate() {
        store
            .delete(NodeId::ROOT, SubTree::Keys, &Key::new(name.as_bytes()))
            .unwrap();
        if (i + 1) % 50 == 0 {
            store.verify_tree(NodeId::ROOT, SubTree::Keys).unwrap();
        }
    }
    store.verify_tree(NodeId::ROOT, SubTree::Keys).unwrap();

    let mut expected: Vec<String> = kept.to_vec();
    expected.sort();
    assert_eq!(
        collect_names(&store, NodeId::ROOT, SubTree::Keys, Order::Ascending),
        expected
    );

    for name in gone {
        assert!(matches!(
            store.find(NodeId::ROOT, &Key::new(name.as_bytes()), SubTree::Keys),
            Err(Error::NotFound)
        ));
    }
    for name in kept {
        store
            .find(NodeId::ROOT, &Key::new(name.as_bytes()), SubTree::Keys)
            .unwrap();
    }
}

#[test]
fn values_iterate_in_name_order() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let k = store.create_key(NodeId::ROOT, &Key::new(b"cfg")).unwrap();

    let mut names: Vec<String> = (0..64).map(|n| format!("v{n:02}")).collect();
    let mut rng = StdRng::seed_from_u64(99);
    names.shuffle(&mut rng);
    for (i, name) in names.iter().enumerate() {
        store
            .create_int32(k, &Key::new(name.as_bytes()), i as i32)
            .unwrap();
    }
    store.verify_tree(k, SubTree::Values).unwrap();

    let mut expected = names.clone();
    expected.sort();
    assert_eq!(
        collect_names(&store, k, SubTree::Values, Order::Ascending),
        expected
    );
}

#[test]
fn seek_lands_on_key_or_neighbor() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);

    for name in [b"b", b"d", b"f"] {
        store.create_key(NodeId::ROOT, &Key::new(name)).unwrap();
    }

    // Exact hit.
    let mut cursor = store.cursor(SubTree::Keys, Order::Ascending);
    let id = cursor.first(NodeId::ROOT, Some(&Key::new(b"d"))).unwrap();
    assert_eq!(store.get_name(id).unwrap(), b"d");
    // Continues past the hit in order.
    let id = cursor.next().unwrap();
    assert_eq!(store.get_name(id).unwrap(), b"f");
    assert!(matches!(cursor.next(), Err(Error::NotFound)));

    // Miss lands on the smallest greater name when ascending.
    let mut cursor = store.cursor(SubTree::Keys, Order::Ascending);
    let id = cursor.first(NodeId::ROOT, Some(&Key::new(b"c"))).unwrap();
    assert_eq!(store.get_name(id).unwrap(), b"d");

    // And on the largest smaller name when descending; "b" is also the last
    // node of the descending walk.
    let mut cursor = store.cursor(SubTree::Keys, Order::Descending);
    let id = cursor.first(NodeId::ROOT, Some(&Key::new(b"c"))).unwrap();
    assert_eq!(store.get_name(id).unwrap(), b"b");
    assert!(matches!(cursor.next(), Err(Error::NotFound)));

    // Off both ends.
    let mut cursor = store.cursor(SubTree::Keys, Order::Ascending);
    assert!(matches!(
        cursor.first(NodeId::ROOT, Some(&Key::new(b"g"))),
        Err(Error::NotFound)
    ));
    let mut cursor = store.cursor(SubTree::Keys, Order::Descending);
    assert!(matches!(
        cursor.first(NodeId::ROOT, Some(&Key::new(b"a"))),
        Err(Error::NotFound)
    ));
}

#[test]
fn mixed_insert_delete_rounds() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir);
    let mut rng = StdRng::seed_from_u64(1234);

    let mut live: Vec<String> = Vec::new();
    for round in 0..10 {
        for i in 0..40 {
            let name = format!("r{round}n{i}");
            store
                .create_key(NodeId::ROOT, &Key::new(name.as_bytes()))
                .unwrap();
            live.push(name);
        }
        live.shuffle(&mut rng);
        for _ in 0..20 {
            let name = live.pop().unwrap();
            store
                .delete(NodeId::ROOT, SubTree::Keys, &Key::new(name.as_bytes()))
                .unwrap();
        }
        store.verify_tree(NodeId::ROOT, SubTree::Keys).unwrap();
    }

    let mut expected = live.clone();
    expected.sort();
    assert_eq!(
        collect_names(&store, NodeId::ROOT, SubTree::Keys, Order::Ascending),
        expected
    );
}
