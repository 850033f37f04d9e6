//! Commit/reopen durability, rollback after eviction failure, autosave
//! eviction, corruption detection, and concurrent readers.

use std::sync::Arc;
use std::thread;

use hivestore::storage::page::{self, PageBytes};
use hivestore::{Error, Key, NodeId, Store, SubTree};
use tempfile::TempDir;

#[test]
fn committed_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("durable.hive");
    {
        let store = Store::options().create(true).open(&path).unwrap();
        let k = store.create_key(NodeId::ROOT, &Key::new(b"cfg")).unwrap();
        store.create_int32(k, &Key::new(b"i"), -123).unwrap();
        store.create_string(k, &Key::new(b"s"), "persisted").unwrap();
        store.create_binary(k, &Key::new(b"b"), &[9, 8, 7]).unwrap();
        store.commit(true).unwrap();
    }

    let store = Store::open(&path).unwrap();
    let k = store
        .find(NodeId::ROOT, &Key::new(b"cfg"), SubTree::Keys)
        .unwrap();
    let i = store.find(k, &Key::new(b"i"), SubTree::Values).unwrap();
    let s = store.find(k, &Key::new(b"s"), SubTree::Values).unwrap();
    let b = store.find(k, &Key::new(b"b"), SubTree::Values).unwrap();
    assert_eq!(store.get_int32(i).unwrap(), -123);
    assert_eq!(store.get_string(s).unwrap(), "persisted");
    assert_eq!(store.get_binary(b).unwrap(), vec![9, 8, 7]);
}

#[test]
fn uncommitted_changes_are_lost_on_close() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lossy.hive");
    {
        let store = Store::options().create(true).open(&path).unwrap();
        store.create_key(NodeId::ROOT, &Key::new(b"kept")).unwrap();
        store.commit(true).unwrap();
        store.create_key(NodeId::ROOT, &Key::new(b"dropped")).unwrap();
        // No commit.
    }

    let store = Store::open(&path).unwrap();
    store
        .find(NodeId::ROOT, &Key::new(b"kept"), SubTree::Keys)
        .unwrap();
    assert!(matches!(
        store.find(NodeId::ROOT, &Key::new(b"dropped"), SubTree::Keys),
        Err(Error::NotFound)
    ));
}

#[test]
fn eviction_without_autosave_aborts_and_rolls_back() {
    let dir = TempDir::new().unwrap();
    let store = Store::options()
        .create(true)
        .cache_kb(64)
        .open(dir.path().join("abort.hive"))
        .unwrap();

    let base = store.create_key(NodeId::ROOT, &Key::new(b"base")).unwrap();
    store.commit(true).unwrap();

    // Fill pages with near-maximum strings until a dirty page has to be
    // evicted; without autosave that aborts the running operation.
    let payload = "p".repeat(249);
    let mut created = 0usize;
    let mut abort = None;
    for i in 0..2000 {
        let name = format!("v{i}");
        match store.create_string(base, &Key::new(name.as_bytes()), &payload) {
            Ok(_) => created += 1,
            Err(e) => {
                abort = Some(e);
                break;
            }
        }
    }
    let abort = abort.expect("a 64 KiB cache must overflow well before 2000 values");
    assert!(matches!(abort, Error::Abort(_)), "got {abort}");
    assert!(created > 0);

    // The failure rolled the store back to the last commit: the committed
    // key is intact and every value created after it is gone, including the
    // ones whose own create succeeded.
    store
        .find(NodeId::ROOT, &Key::new(b"base"), SubTree::Keys)
        .unwrap();
    for i in 0..created {
        let name = format!("v{i}");
        assert!(
            matches!(
                store.find(base, &Key::new(name.as_bytes()), SubTree::Values),
                Err(Error::NotFound)
            ),
            "value {name} should have been rolled back"
        );
    }
    assert!(store.cache_consistent());

    // The store remains usable and committable.
    store.create_int32(base, &Key::new(b"after"), 1).unwrap();
    store.commit(true).unwrap();
}

#[test]
fn any_write_failure_reverts_to_the_last_commit() {
    let dir = TempDir::new().unwrap();
    let store = Store::options()
        .create(true)
        .open(dir.path().join("revert.hive"))
        .unwrap();

    store.create_key(NodeId::ROOT, &Key::new(b"a")).unwrap();
    store.commit(true).unwrap();
    store.create_key(NodeId::ROOT, &Key::new(b"b")).unwrap();

    // The duplicate fails, and the rollback it triggers also discards the
    // uncommitted "b".
    assert!(matches!(
        store.create_key(NodeId::ROOT, &Key::new(b"a")),
        Err(Error::Exists)
    ));
    store
        .find(NodeId::ROOT, &Key::new(b"a"), SubTree::Keys)
        .unwrap();
    assert!(matches!(
        store.find(NodeId::ROOT, &Key::new(b"b"), SubTree::Keys),
        Err(Error::NotFound)
    ));
}

#[test]
fn autosave_spills_dirty_pages_and_preserves_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("autosave.hive");
    let count = 600usize;
    {
        let store = Store::options()
            .create(true)
            .cache_kb(64)
            .autosave(true)
            .open(&path)
            .unwrap();
        let k = store.create_key(NodeId::ROOT, &Key::new(b"bulk")).unwrap();
        let payload = "d".repeat(200);
        for i in 0..count {
            let name = format!("item{i:04}");
            store
                .create_string(k, &Key::new(name.as_bytes()), &payload)
                .unwrap();
        }
        store.verify_tree(k, SubTree::Values).unwrap();
        store.commit(true).unwrap();
    }

    let store = Store::options().cache_kb(64).open(&path).unwrap();
    let k = store
        .find(NodeId::ROOT, &Key::new(b"bulk"), SubTree::Keys)
        .unwrap();
    for i in (0..count).step_by(97) {
        let name = format!("item{i:04}");
        let v = store.find(k, &Key::new(name.as_bytes()), SubTree::Values).unwrap();
        assert_eq!(store.get_string(v).unwrap(), "d".repeat(200));
    }
}

#[test]
fn flipped_byte_is_detected_as_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt.hive");
    {
        let store = Store::options().create(true).open(&path).unwrap();
        store.create_key(NodeId::ROOT, &Key::new(b"k")).unwrap();
        store.commit(true).unwrap();
    }

    // Flip one byte inside the first data page.
    {
        use std::fs::OpenOptions;
        use std::io::{Read, Seek, SeekFrom, Write};
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(4096 + 300)).unwrap();
        let mut b = [0u8; 1];
        file.read_exact(&mut b).unwrap();
        b[0] ^= 0xFF;
        file.seek(SeekFrom::Start(4096 + 300)).unwrap();
        file.write_all(&b).unwrap();
    }

    // The header still checks out, so open succeeds; touching the damaged
    // page surfaces the corruption.
    let store = Store::open(&path).unwrap();
    let err = store
        .find(NodeId::ROOT, &Key::new(b"k"), SubTree::Keys)
        .unwrap_err();
    assert!(matches!(err, Error::Corrupt(_)), "got {err}");
}

#[test]
fn foreign_format_variants_are_rejected() {
    let dir = TempDir::new().unwrap();

    // A header claiming a different page size.
    let path = dir.path().join("pagesize.hive");
    let mut bytes: Box<PageBytes> = Box::new([0u8; 4096]);
    {
        let f = page::header_fields_mut(&mut bytes);
        f.set_page_count(1);
        f.set_page_size(8192);
    }
    let sum = page::page_checksum(&bytes);
    page::prefix_mut(&mut bytes).set_checksum(sum);
    std::fs::write(&path, &bytes[..]).unwrap();
    assert!(matches!(Store::open(&path), Err(Error::Corrupt(_))));

    // A big-endian file is refused rather than misread.
    let path = dir.path().join("bigendian.hive");
    let mut bytes: Box<PageBytes> = Box::new([0u8; 4096]);
    {
        let f = page::header_fields_mut(&mut bytes);
        f.set_page_count(1);
        f.set_page_size(4096);
        f.set_flags(page::FILE_FLAG_BIG_ENDIAN);
    }
    let sum = page::page_checksum(&bytes);
    page::prefix_mut(&mut bytes).set_checksum(sum);
    std::fs::write(&path, &bytes[..]).unwrap();
    assert!(matches!(Store::open(&path), Err(Error::Corrupt(_))));
}

#[test]
fn parallel_readers_share_the_store() {
    let dir = TempDir::new().unwrap();
    let store = Store::options()
        .create(true)
        .cache_kb(128)
        .open(dir.path().join("parallel.hive"))
        .unwrap();

    let k = store.create_key(NodeId::ROOT, &Key::new(b"shared")).unwrap();
    for i in 0..100 {
        let name = format!("n{i:03}");
        store
            .create_int32(k, &Key::new(name.as_bytes()), i)
            .unwrap();
    }
    store.commit(true).unwrap();

    let store = Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let k = store
                .find(NodeId::ROOT, &Key::new(b"shared"), SubTree::Keys)
                .unwrap();
            for _round in 0..20 {
                for i in (0..100).step_by(7) {
                    let name = format!("n{i:03}");
                    let v = store
                        .find(k, &Key::new(name.as_bytes()), SubTree::Values)
                        .unwrap();
                    assert_eq!(store.get_int32(v).unwrap(), i);
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(store.cache_consistent());
}
