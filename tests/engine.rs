//! End-to-end engine scenarios: durability across restarts, crash
//! recovery from the log, fast truncate under concurrent snapshots, the
//! async flush barrier, verification, and backup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burrowdb::{Engine, EngineConfig, Error, OpKind, StoreKind};

fn config() -> EngineConfig {
    EngineConfig {
        cache_size: 32 << 20,
        allocation_unit: 512,
        extend_stride: 64 * 1024,
        log_file_size: 1 << 20,
        split_size: 4096,
        async_workers: 4,
        ..Default::default()
    }
}

fn key(i: u32) -> Vec<u8> {
    format!("key{i:06}").into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("value-{i}").into_bytes()
}

#[test]
fn checkpoint_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), config()).unwrap();
        engine.create_table("t", StoreKind::Row).unwrap();
        let table = engine.open_table("t").unwrap();
        let session = engine.open_session();
        for i in 0..10_000u32 {
            table.put(&session, &key(i), &value(i)).unwrap();
        }
        engine.checkpoint().unwrap();
        // Kill the process without a clean close.
        engine.crash();
    }
    let engine = Engine::open(dir.path(), config()).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    let rows = table.scan(&session).unwrap();
    assert_eq!(rows.len(), 10_000);
    for (i, (k, v)) in rows.iter().enumerate() {
        assert_eq!(k, &key(i as u32));
        assert_eq!(v, &value(i as u32));
    }
    engine.close().unwrap();
}

#[test]
fn log_recovers_uncheckpointed_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), config()).unwrap();
        engine.create_table("t", StoreKind::Row).unwrap();
        let table = engine.open_table("t").unwrap();
        let session = engine.open_session();
        // Everything after table creation lives only in the log.
        for i in 0..500u32 {
            table.put(&session, &key(i), &value(i)).unwrap();
        }
        table.remove(&session, &key(7)).unwrap();
        engine.crash();
    }
    let engine = Engine::open(dir.path(), config()).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    assert_eq!(table.get(&session, &key(3)).unwrap(), Some(value(3)));
    assert_eq!(table.get(&session, &key(7)).unwrap(), None);
    assert_eq!(table.scan(&session).unwrap().len(), 499);
    engine.close().unwrap();
}

#[test]
fn transactions_commit_and_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.create_table("t", StoreKind::Row).unwrap();
    let table = engine.open_table("t").unwrap();

    let writer = engine.open_session();
    let reader = engine.open_session();

    writer.begin().unwrap();
    table.put(&writer, b"a", b"1").unwrap();
    table.put(&writer, b"b", b"2").unwrap();
    // Uncommitted writes are invisible to another session.
    assert_eq!(table.get(&reader, b"a").unwrap(), None);
    engine.commit_session(&writer).unwrap();
    assert_eq!(table.get(&reader, b"a").unwrap(), Some(b"1".to_vec()));

    writer.begin().unwrap();
    table.put(&writer, b"a", b"overwritten").unwrap();
    engine.rollback_session(&writer).unwrap();
    assert_eq!(table.get(&reader, b"a").unwrap(), Some(b"1".to_vec()));

    // Insert-only semantics surface duplicates.
    assert!(matches!(
        table.insert(&reader, b"a", b"again"),
        Err(Error::DuplicateKey)
    ));
    engine.close().unwrap();
}

#[test]
fn column_store_appends_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), config()).unwrap();
        engine.create_table("c", StoreKind::ColVar).unwrap();
        let table = engine.open_table("c").unwrap();
        let session = engine.open_session();
        for i in 0..100u32 {
            let recno = table.append(&session, &value(i)).unwrap();
            assert_eq!(recno, u64::from(i) + 1);
        }
        table.remove_col(&session, 50).unwrap();
        engine.crash();
    }
    let engine = Engine::open(dir.path(), config()).unwrap();
    let table = engine.open_table("c").unwrap();
    let session = engine.open_session();
    assert_eq!(table.get_col(&session, 1).unwrap(), Some(value(0)));
    assert_eq!(table.get_col(&session, 100).unwrap(), Some(value(99)));
    assert_eq!(table.get_col(&session, 50).unwrap(), None);
    engine.close().unwrap();
}

#[test]
fn fast_truncate_respects_old_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.create_table("t", StoreKind::Row).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    for i in 0..1000u32 {
        table.put(&session, &key(i), &value(i)).unwrap();
    }
    // Split the tree so subtrees exist to truncate.
    engine.checkpoint().unwrap();

    let tree = table.tree();
    let root = tree.root();
    let root_page = tree.page_in(&root).unwrap();
    let index = root_page.index().expect("the root should have split");
    let victim = index[0].clone();

    // T0 starts before the truncate and must keep seeing every row.
    let t0 = engine.open_session();
    t0.begin().unwrap();

    let t1 = engine.open_session();
    tree.truncate_ref(&t1, &victim).unwrap();

    // The old snapshot still reads the truncated subtree's rows through
    // on-demand instantiation.
    assert_eq!(table.scan(&t0).unwrap().len(), 1000);

    // A fresh snapshot no longer sees them.
    let t2 = engine.open_session();
    let after = table.scan(&t2).unwrap().len();
    assert!(after < 1000, "truncate removed nothing");

    // Once the old reader ends, a checkpoint reclaims the subtree.
    t0.commit().unwrap();
    engine.checkpoint().unwrap();
    let t3 = engine.open_session();
    assert_eq!(table.scan(&t3).unwrap().len(), after);
    engine.close().unwrap();
}

#[test]
fn async_flush_fires_after_all_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.create_table("t", StoreKind::Row).unwrap();
    let session = engine.open_session();

    let completed = Arc::new(AtomicUsize::new(0));
    for i in 0..100u32 {
        let completed = completed.clone();
        engine
            .async_submit(
                &session,
                "table:t",
                "",
                OpKind::Put {
                    key: key(i),
                    value: value(i),
                },
                Box::new(move |r| {
                    r.unwrap();
                    completed.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }
    engine.async_flush(&session).unwrap();
    assert_eq!(completed.load(Ordering::SeqCst), 100);

    // The inserts are all there, in per-submitter order effects.
    let table = engine.open_table("t").unwrap();
    assert_eq!(table.scan(&session).unwrap().len(), 100);
    engine.close().unwrap();
}

#[test]
fn async_get_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.create_table("t", StoreKind::Row).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    table.put(&session, b"k", b"v").unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    engine
        .async_submit(
            &session,
            "table:t",
            "",
            OpKind::Get { key: b"k".to_vec() },
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        )
        .unwrap();
    let got = rx.recv().unwrap().unwrap();
    assert_eq!(got, Some(b"v".to_vec()));
    engine.close().unwrap();
}

#[test]
fn verify_accepts_a_clean_table() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.create_table("t", StoreKind::Row).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    for i in 0..2000u32 {
        table.put(&session, &key(i), &value(i)).unwrap();
    }
    engine.verify_table("t").unwrap();
    engine.close().unwrap();
}

#[test]
fn overflow_values_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.create_table("t", StoreKind::Row).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    // split_size is 4096, so these values go to overflow blocks.
    let big = vec![0xA5u8; 3000];
    table.put(&session, b"big", &big).unwrap();
    table.put(&session, b"small", b"s").unwrap();
    engine.checkpoint().unwrap();
    assert_eq!(table.get(&session, b"big").unwrap(), Some(big.clone()));

    // Replace the overflow value; readers that started first still see it.
    let old_reader = engine.open_session();
    old_reader.begin().unwrap();
    assert_eq!(table.get(&old_reader, b"big").unwrap(), Some(big.clone()));
    table.put(&session, b"big", b"tiny now").unwrap();
    engine.checkpoint().unwrap();
    assert_eq!(table.get(&old_reader, b"big").unwrap(), Some(big));
    old_reader.commit().unwrap();
    assert_eq!(
        table.get(&session, b"big").unwrap(),
        Some(b"tiny now".to_vec())
    );
    engine.close().unwrap();
}

#[test]
fn backup_opens_as_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), config()).unwrap();
        engine.create_table("t", StoreKind::Row).unwrap();
        let table = engine.open_table("t").unwrap();
        let session = engine.open_session();
        for i in 0..200u32 {
            table.put(&session, &key(i), &value(i)).unwrap();
        }
        engine.backup(backup_dir.path().join("copy")).unwrap();
        engine.close().unwrap();
    }
    let engine = Engine::open(backup_dir.path().join("copy"), config()).unwrap();
    let table = engine.open_table("t").unwrap();
    let session = engine.open_session();
    assert_eq!(table.scan(&session).unwrap().len(), 200);
    engine.close().unwrap();
}

#[test]
fn second_opener_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), config()).unwrap();
    assert!(matches!(
        Engine::open(dir.path(), config()),
        Err(Error::HomeLock(_))
    ));
    engine.close().unwrap();
    // After close the home can be opened again.
    let engine = Engine::open(dir.path(), config()).unwrap();
    engine.close().unwrap();
}

#[test]
fn durable_lsn_is_monotone_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(Engine::open(dir.path(), config()).unwrap());
    engine.create_table("t", StoreKind::Row).unwrap();

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let engine = engine.clone();
        handles.push(std::thread::spawn(move || {
            let table = engine.open_table("t").unwrap();
            let session = engine.open_session();
            let mut last = engine.durable_lsn();
            for i in 0..100u32 {
                table.put(&session, &key(t * 1000 + i), &value(i)).unwrap();
                let now = engine.durable_lsn();
                assert!(now >= last, "durable LSN moved backward");
                last = now;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let session = engine.open_session();
    let table = engine.open_table("t").unwrap();
    assert_eq!(table.scan(&session).unwrap().len(), 400);
    drop(session);
    drop(table);
    Arc::try_unwrap(engine)
        .map_err(|_| ())
        .expect("engine still shared")
        .close()
        .unwrap();
}

#[test]
fn dropped_table_is_gone_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = Engine::open(dir.path(), config()).unwrap();
        engine.create_table("keep", StoreKind::Row).unwrap();
        engine.create_table("gone", StoreKind::Row).unwrap();
        engine.drop_table("gone").unwrap();
        assert!(matches!(
            engine.open_table("gone"),
            Err(Error::NotFound)
        ));
        engine.close().unwrap();
    }
    let engine = Engine::open(dir.path(), config()).unwrap();
    assert!(engine.open_table("keep").is_ok());
    assert!(matches!(engine.open_table("gone"), Err(Error::NotFound)));
    engine.close().unwrap();
}
