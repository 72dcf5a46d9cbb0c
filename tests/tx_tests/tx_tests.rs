//! Tests for Tx
//!
//! These tests verify:
//! - Commit and rollback semantics
//! - update/view helpers
//! - Read-only enforcement
//! - Snapshot isolation between readers and the writer
//! - Single-writer serialization
//! - Page reuse through the free list
//! - Consistency checking

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use boltkv::{BoltError, Db, Options};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, Db) {
    let temp_dir = TempDir::new().unwrap();
    let db = Db::open(temp_dir.path().join("test.db"), Options::default()).unwrap();
    (temp_dir, db)
}

fn get(db: &Db, bucket: &[u8], key: &[u8]) -> Option<Vec<u8>> {
    db.view(|tx| match tx.bucket(bucket)? {
        Some(b) => Ok(b.get(key)?.map(|v| v.to_vec())),
        None => Ok(None),
    })
    .unwrap()
}

// =============================================================================
// Commit / Rollback Tests
// =============================================================================

#[test]
fn test_commit_persists_changes() {
    let (_temp, db) = setup_temp_db();

    let mut tx = db.begin_write().unwrap();
    assert!(tx.writable());
    assert_eq!(tx.id(), 2);
    tx.create_bucket(b"b").unwrap().put(b"k", b"v").unwrap();
    tx.commit().unwrap();

    assert_eq!(get(&db, b"b", b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_rollback_discards_changes() {
    let (_temp, db) = setup_temp_db();

    let mut tx = db.begin_write().unwrap();
    tx.create_bucket(b"b").unwrap().put(b"k", b"v").unwrap();
    tx.rollback().unwrap();

    db.view(|tx| {
        assert!(tx.bucket(b"b")?.is_none());
        assert_eq!(tx.id(), 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_drop_rolls_back_and_releases_writer() {
    let (_temp, db) = setup_temp_db();

    {
        let mut tx = db.begin_write().unwrap();
        tx.create_bucket(b"b").unwrap();
    }

    // A leaked writer permit would block here.
    let tx = db.begin_write().unwrap();
    assert_eq!(tx.id(), 2);
    tx.rollback().unwrap();
    assert_eq!(get(&db, b"b", b"k"), None);
}

#[test]
fn test_update_commits_on_success() {
    let (_temp, db) = setup_temp_db();

    let value = db
        .update(|tx| {
            tx.create_bucket(b"b")?.put(b"k", b"v")?;
            Ok(42)
        })
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(get(&db, b"b", b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_update_rolls_back_on_error() {
    let (_temp, db) = setup_temp_db();

    let result: boltkv::Result<()> = db.update(|tx| {
        tx.create_bucket(b"b")?.put(b"k", b"v")?;
        Err(BoltError::KeyRequired)
    });

    assert!(matches!(result, Err(BoltError::KeyRequired)));
    db.view(|tx| {
        assert!(tx.bucket(b"b")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_rolled_back_pages_are_reusable() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b").map(|_| ())).unwrap();

    for _ in 0..10 {
        let mut tx = db.begin_write().unwrap();
        let mut b = tx.bucket(b"b").unwrap().unwrap();
        for i in 0..100u32 {
            b.put(&i.to_be_bytes(), &[0u8; 64]).unwrap();
        }
        tx.rollback().unwrap();
    }

    db.view(|tx| {
        assert!(tx.size() <= 8 * 4096);
        tx.check()
    })
    .unwrap();
}

#[test]
fn test_on_commit_runs_after_commit_only() {
    let (_temp, db) = setup_temp_db();
    let committed = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&committed);
    let mut tx = db.begin_write().unwrap();
    tx.on_commit(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    tx.rollback().unwrap();
    assert_eq!(committed.load(Ordering::SeqCst), 0);

    let counter = Arc::clone(&committed);
    db.update(|tx| {
        tx.on_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tx.create_bucket(b"b").map(|_| ())
    })
    .unwrap();
    assert_eq!(committed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_commit_handler_sees_committed_state() {
    let (_temp, db) = setup_temp_db();
    let seen = Arc::new(AtomicBool::new(false));

    let handle = db.clone();
    let flag = Arc::clone(&seen);
    db.update(move |tx| {
        tx.on_commit(move || {
            let value = handle
                .view(|tx| match tx.bucket(b"b")? {
                    Some(b) => b.get(b"k"),
                    None => Ok(None),
                })
                .unwrap();
            flag.store(value.is_some(), Ordering::SeqCst);
        });
        tx.create_bucket(b"b")?.put(b"k", b"v")
    })
    .unwrap();

    assert!(seen.load(Ordering::SeqCst));
}

// =============================================================================
// Read-Only Tests
// =============================================================================

#[test]
fn test_read_tx_rejects_writes() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"v")).unwrap();

    let mut tx = db.begin_read().unwrap();
    assert!(!tx.writable());
    assert!(matches!(tx.create_bucket(b"c"), Err(BoltError::TxNotWritable)));
    assert!(matches!(tx.delete_bucket(b"b"), Err(BoltError::TxNotWritable)));

    let mut b = tx.bucket(b"b").unwrap().unwrap();
    assert!(!b.writable());
    assert!(matches!(b.put(b"k", b"x"), Err(BoltError::TxNotWritable)));
    assert!(matches!(b.delete(b"k"), Err(BoltError::TxNotWritable)));
    assert!(matches!(b.next_sequence(), Err(BoltError::TxNotWritable)));

    assert!(matches!(tx.commit(), Err(BoltError::TxNotWritable)));
    assert_eq!(get(&db, b"b", b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_view_result_is_returned() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"v")).unwrap();

    let len = db
        .view(|tx| {
            let b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
            Ok(b.get(b"k")?.map(|v| v.len()))
        })
        .unwrap();
    assert_eq!(len, Some(1));

    let missing = db.view(|tx| tx.bucket(b"nope")?.ok_or(BoltError::BucketNotFound).map(|_| ()));
    assert!(matches!(missing, Err(BoltError::BucketNotFound)));
}

// =============================================================================
// Isolation Tests
// =============================================================================

#[test]
fn test_reader_keeps_its_snapshot() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"old")).unwrap();

    let mut reader = db.begin_read().unwrap();
    assert_eq!(
        reader.bucket(b"b").unwrap().unwrap().get(b"k").unwrap().as_deref(),
        Some(&b"old"[..])
    );

    db.update(|tx| tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?.put(b"k", b"new"))
        .unwrap();
    db.update(|tx| tx.create_bucket(b"c").map(|_| ())).unwrap();

    assert_eq!(
        reader.bucket(b"b").unwrap().unwrap().get(b"k").unwrap().as_deref(),
        Some(&b"old"[..])
    );
    assert!(reader.bucket(b"c").unwrap().is_none());
    reader.rollback().unwrap();

    assert_eq!(get(&db, b"b", b"k"), Some(b"new".to_vec()));
}

#[test]
fn test_writer_sees_its_own_changes() {
    let (_temp, db) = setup_temp_db();

    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        b.put(b"k", b"v1")?;
        assert_eq!(b.get(b"k")?.as_deref(), Some(&b"v1"[..]));
        b.put(b"k", b"v2")?;
        assert_eq!(b.get(b"k")?.as_deref(), Some(&b"v2"[..]));
        b.delete(b"k")?;
        assert!(b.get(b"k")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_second_writer_waits() {
    let (_temp, db) = setup_temp_db();
    let started = Arc::new(AtomicBool::new(false));

    let tx = db.begin_write().unwrap();

    let handle = db.clone();
    let flag = Arc::clone(&started);
    let waiter = thread::spawn(move || {
        let tx = handle.begin_write().unwrap();
        flag.store(true, Ordering::SeqCst);
        let id = tx.id();
        tx.rollback().unwrap();
        id
    });

    thread::sleep(Duration::from_millis(100));
    assert!(!started.load(Ordering::SeqCst));

    tx.commit().unwrap();
    let id = waiter.join().unwrap();
    assert!(started.load(Ordering::SeqCst));
    assert_eq!(id, 3);
}

#[test]
fn test_concurrent_readers_during_writes() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        for i in 0..100u32 {
            b.put(&i.to_be_bytes(), b"initial")?;
        }
        Ok(())
    })
    .unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    let count = db
                        .view(|tx| {
                            let mut n = 0;
                            tx.bucket(b"b")?
                                .ok_or(BoltError::BucketNotFound)?
                                .for_each(|_, _| {
                                    n += 1;
                                    Ok(())
                                })?;
                            Ok(n)
                        })
                        .unwrap();
                    assert!(count >= 100);
                }
            })
        })
        .collect();

    for round in 0..20u32 {
        db.update(|tx| {
            let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
            for i in 0..50u32 {
                b.put(&(1000 + round * 50 + i).to_be_bytes(), &[7u8; 100])?;
            }
            Ok(())
        })
        .unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }
    db.view(|tx| tx.check()).unwrap();
}

// =============================================================================
// Free List Tests
// =============================================================================

#[test]
fn test_pages_are_reused_without_readers() {
    let (_temp, db) = setup_temp_db();

    for i in 0..100u32 {
        db.update(|tx| tx.create_bucket(b"b")?.put(b"counter", &i.to_be_bytes()))
            .unwrap();
    }

    db.view(|tx| {
        assert_eq!(tx.id(), 101);
        assert!(tx.size() <= 10 * 4096);
        tx.check()
    })
    .unwrap();
}

#[test]
fn test_open_reader_pins_freed_pages() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"v")).unwrap();

    let reader = db.begin_read().unwrap();
    for i in 0..10u32 {
        db.update(|tx| tx.create_bucket(b"b")?.put(b"k", &i.to_be_bytes()))
            .unwrap();
    }
    let pinned = db.stats();
    assert!(pinned.pending_page_n >= 10);

    reader.rollback().unwrap();
    db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"last")).unwrap();
    let released = db.stats();
    assert!(released.free_page_n > pinned.free_page_n);
    assert!(released.pending_page_n < pinned.pending_page_n);
}

// =============================================================================
// Check / Stats Tests
// =============================================================================

#[test]
fn test_check_after_mixed_workload() {
    let (_temp, db) = setup_temp_db();

    db.update(|tx| {
        for name in [&b"alpha"[..], &b"beta"[..], &b"gamma"[..]] {
            let mut b = tx.create_bucket(name)?;
            for i in 0..500u32 {
                b.put(&i.to_be_bytes(), &[1u8; 40])?;
            }
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut b = tx.bucket(b"beta")?.ok_or(BoltError::BucketNotFound)?;
        for i in (0..500u32).step_by(2) {
            b.delete(&i.to_be_bytes())?;
        }
        tx.delete_bucket(b"gamma")
    })
    .unwrap();

    db.view(|tx| tx.check()).unwrap();
    db.update(|tx| tx.check()).unwrap();
}

#[test]
fn test_tx_stats_count_work() {
    let (_temp, db) = setup_temp_db();

    let mut tx = db.begin_write().unwrap();
    {
        let mut b = tx.create_bucket(b"b").unwrap();
        for i in 0..1000u32 {
            b.put(&i.to_be_bytes(), &[0u8; 32]).unwrap();
        }
    }
    assert!(tx.stats().node_count > 0);
    tx.commit().unwrap();

    let stats = db.stats().tx_stats;
    assert!(stats.split > 0);
    assert!(stats.spill > 0);
    assert!(stats.write > 2);
    assert!(stats.node_count > 0);
}
