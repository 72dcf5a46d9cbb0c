//! Tests for Cursor
//!
//! These tests verify:
//! - Forward and backward iteration
//! - Seek semantics (exact, between keys, past the end)
//! - Nested buckets surfacing with no value
//! - Deletion through a cursor
//! - Iteration over uncommitted and multi-page trees

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

/// Bucket "b" holding keys "b", "d", "f" with upper-case values
fn setup_letters() -> (TempDir, Db) {
    let (temp, db) = setup_temp_db();
    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        b.put(b"d", b"D")?;
        b.put(b"b", b"B")?;
        b.put(b"f", b"F")
    })
    .unwrap();
    (temp, db)
}

fn pair(key: &[u8], value: &[u8]) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
    Some((key.to_vec(), Some(value.to_vec())))
}

type Owned = Option<(Vec<u8>, Option<Vec<u8>>)>;

fn owned(entry: boltkv::Result<Option<(boltkv::Item, Option<boltkv::Item>)>>) -> Owned {
    entry.unwrap().map(|(k, v)| (k.to_vec(), v.map(|v| v.to_vec())))
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_cursor_empty_bucket() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"empty").map(|_| ())).unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"empty")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        assert!(c.first()?.is_none());
        assert!(c.last()?.is_none());
        assert!(c.seek(b"a")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_forward() {
    let (_temp, db) = setup_letters();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        assert_eq!(owned(c.first()), pair(b"b", b"B"));
        assert_eq!(owned(c.next()), pair(b"d", b"D"));
        assert_eq!(owned(c.next()), pair(b"f", b"F"));
        assert_eq!(owned(c.next()), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_backward() {
    let (_temp, db) = setup_letters();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        assert_eq!(owned(c.last()), pair(b"f", b"F"));
        assert_eq!(owned(c.prev()), pair(b"d", b"D"));
        assert_eq!(owned(c.prev()), pair(b"b", b"B"));
        assert_eq!(owned(c.prev()), None);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_changes_direction() {
    let (_temp, db) = setup_letters();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        assert_eq!(owned(c.first()), pair(b"b", b"B"));
        assert_eq!(owned(c.next()), pair(b"d", b"D"));
        assert_eq!(owned(c.prev()), pair(b"b", b"B"));
        assert_eq!(owned(c.last()), pair(b"f", b"F"));
        assert_eq!(owned(c.prev()), pair(b"d", b"D"));
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Seek Tests
// =============================================================================

#[test]
fn test_cursor_seek() {
    let (_temp, db) = setup_letters();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();

        // Exact match.
        assert_eq!(owned(c.seek(b"d")), pair(b"d", b"D"));
        // Between keys lands on the next one.
        assert_eq!(owned(c.seek(b"c")), pair(b"d", b"D"));
        assert_eq!(owned(c.seek(b"a")), pair(b"b", b"B"));
        // Past the end.
        assert_eq!(owned(c.seek(b"g")), None);

        assert_eq!(owned(c.seek(b"e")), pair(b"f", b"F"));
        assert_eq!(owned(c.prev()), pair(b"d", b"D"));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_seek_across_pages() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        for i in (0..5000u32).map(|i| i * 2) {
            b.put(&i.to_be_bytes(), &i.to_le_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        for target in [1u32, 999, 2501, 7777, 9997] {
            let want = target + 1;
            let (k, v) = c.seek(&target.to_be_bytes())?.expect("entry after target");
            assert_eq!(k.as_ref(), &want.to_be_bytes());
            assert_eq!(v.as_deref(), Some(&want.to_le_bytes()[..]));
        }
        assert!(c.seek(&9999u32.to_be_bytes())?.is_none());
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Nested Bucket Tests
// =============================================================================

#[test]
fn test_cursor_reports_buckets_without_value() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        b.put(b"a", b"1")?;
        b.create_bucket(b"m")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        assert_eq!(owned(c.first()), pair(b"a", b"1"));
        assert_eq!(owned(c.next()), Some((b"m".to_vec(), None)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_tx_cursor_lists_top_level_buckets() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| {
        for name in [&b"zeta"[..], &b"alpha"[..], &b"mid"[..]] {
            tx.create_bucket(name)?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut c = tx.cursor();
        let mut names = Vec::new();
        let mut entry = c.first()?;
        while let Some((name, value)) = entry {
            assert!(value.is_none());
            names.push(name.to_vec());
            entry = c.next()?;
        }
        assert_eq!(names, vec![b"alpha".to_vec(), b"mid".to_vec(), b"zeta".to_vec()]);
        Ok(())
    })
    .unwrap();
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_cursor_delete() {
    let (_temp, db) = setup_letters();

    db.update(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        c.seek(b"d")?;
        c.delete()?;
        assert_eq!(owned(c.first()), pair(b"b", b"B"));
        assert_eq!(owned(c.next()), pair(b"f", b"F"));
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        assert!(b.get(b"d")?.is_none());
        assert_eq!(b.get(b"b")?.as_deref(), Some(&b"B"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_delete_bucket_entry_rejected() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| tx.create_bucket(b"b")?.create_bucket(b"child").map(|_| ()))
        .unwrap();

    db.update(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        c.first()?;
        assert!(matches!(c.delete(), Err(BoltError::IncompatibleValue)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_delete_in_read_tx_rejected() {
    let (_temp, db) = setup_letters();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        c.first()?;
        assert!(matches!(c.delete(), Err(BoltError::TxNotWritable)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_cursor_delete_many_across_pages() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        for i in 0..3000u32 {
            b.put(&i.to_be_bytes(), &[1u8; 24])?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut c = b.cursor();
        for i in (0..3000u32).filter(|i| i % 3 != 0) {
            let (k, _) = c.seek(&i.to_be_bytes())?.expect("key present");
            assert_eq!(k.as_ref(), &i.to_be_bytes());
            c.delete()?;
        }
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        let mut keys = Vec::new();
        b.for_each(|k, _| {
            keys.push(u32::from_be_bytes([k[0], k[1], k[2], k[3]]));
            Ok(())
        })?;
        let want: Vec<u32> = (0..3000u32).filter(|i| i % 3 == 0).collect();
        assert_eq!(keys, want);
        tx.check()
    })
    .unwrap();
}

// =============================================================================
// Mixed Source Tests
// =============================================================================

#[test]
fn test_cursor_sees_uncommitted_changes() {
    let (_temp, db) = setup_temp_db();
    db.update(|tx| {
        let mut b = tx.create_bucket(b"b")?;
        for i in 0..1000u32 {
            b.put(&(i * 2).to_be_bytes(), b"committed")?;
        }
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut b = tx.bucket(b"b")?.ok_or(BoltError::BucketNotFound)?;
        for i in 0..1000u32 {
            if i % 10 == 0 {
                b.put(&(i * 2 + 1).to_be_bytes(), b"fresh")?;
            }
        }

        let mut c = b.cursor();
        let mut count = 0;
        let mut last: Option<Vec<u8>> = None;
        let mut entry = c.first()?;
        while let Some((k, _)) = entry {
            if let Some(prev) = &last {
                assert!(prev.as_slice() < k.as_ref());
            }
            last = Some(k.to_vec());
            count += 1;
            entry = c.next()?;
        }
        assert_eq!(count, 1100);

        let mut count_back = 0;
        let mut entry = c.last()?;
        while entry.is_some() {
            count_back += 1;
            entry = c.prev()?;
        }
        assert_eq!(count_back, 1100);
        Ok(())
    })
    .unwrap();
}
