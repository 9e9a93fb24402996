//! End-to-end tests over the public surface: open, view, transaction,
//! compact, close, destroy.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::Arc;
use std::thread;

use kodama::{Database, Error, Node, Value};
use serde_json::json;

fn open_temp() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db")).unwrap();
    (dir, db)
}

fn map_addr(db: &Database, key: &str) -> u64 {
    db.view()
        .unwrap()
        .get(key)
        .unwrap()
        .unwrap()
        .as_map()
        .unwrap()
        .addr()
        .unwrap()
}

#[test]
fn empty_database() {
    let (_dir, db) = open_temp();
    assert_eq!(db.view().unwrap().to_json().unwrap(), json!({}));
    assert_eq!(db.size().unwrap(), 12);
}

#[test]
fn round_trip_nested_tree() {
    let (_dir, db) = open_temp();
    db.transaction(|root| {
        root.set("people", Value::from_json(&json!(["Jim", "Phil"])))?;
        root.set("score", Value::from_json(&json!({"top": 8})))
    })
    .unwrap();

    assert_eq!(
        db.view().unwrap().to_json().unwrap(),
        json!({"people": ["Jim", "Phil"], "score": {"top": 8}})
    );
}

#[test]
fn sequences_write_back_in_place() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("people", Value::from_json(&json!(["Jim", "Phil"]))))
        .unwrap();

    db.transaction(|root| {
        let mut people = match root.get("people")? {
            Some(Value::Seq(items)) => items,
            other => panic!("unexpected: {other:?}"),
        };
        people.pop();
        root.set("people", people)
    })
    .unwrap();

    assert_eq!(
        db.view().unwrap().to_json().unwrap(),
        json!({"people": ["Jim"]})
    );
}

#[test]
fn structural_sharing_by_address() {
    let (_dir, db) = open_temp();
    db.transaction(|root| {
        root.set("people", Value::from_json(&json!(["Jim", "Phil"])))?;
        root.set("score", Value::from_json(&json!({"top": 8})))
    })
    .unwrap();
    let original = map_addr(&db, "score");

    // Assign a handle from an older read view, and rewrite an equal
    // mapping from scratch. Both must resolve to the committed record.
    db.transaction(|root| {
        let snapshot = db.view()?;
        root.set("score2", snapshot.get("score")?.unwrap())?;
        root.set("score", Value::from_json(&json!({"top": 8})))
    })
    .unwrap();

    assert_eq!(map_addr(&db, "score2"), original);
    assert_eq!(map_addr(&db, "score"), original);
    assert_eq!(
        db.view().unwrap().to_json().unwrap(),
        json!({"people": ["Jim", "Phil"], "score": {"top": 8}, "score2": {"top": 8}})
    );
}

#[test]
fn noop_transactions_write_nothing() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("x", Value::from_json(&json!({"a": 1}))))
        .unwrap();
    let size = db.size().unwrap();
    let root_addr = db.view().unwrap().addr().unwrap();

    db.transaction(|_root| Ok(())).unwrap();

    db.transaction(|root| {
        let x = root.get("x")?.unwrap();
        root.set("x", x)
    })
    .unwrap();

    assert_eq!(db.size().unwrap(), size);
    assert_eq!(db.view().unwrap().addr().unwrap(), root_addr);
}

#[test]
fn snapshots_are_immutable() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("k", "before")).unwrap();
    let snapshot = db.view().unwrap();

    db.transaction(|root| root.set("k", "after")).unwrap();

    assert_eq!(snapshot.to_json().unwrap(), json!({"k": "before"}));
    assert_eq!(db.view().unwrap().to_json().unwrap(), json!({"k": "after"}));
}

#[test]
fn persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let db = Database::open(&path).unwrap();
    db.transaction(|root| root.set("kept", Value::from_json(&json!({"n": 1}))))
        .unwrap();
    db.close();
    assert!(db.is_closed());
    assert!(matches!(db.view(), Err(Error::Closed)));

    let db = Database::open(&path).unwrap();
    assert_eq!(db.view().unwrap().to_json().unwrap(), json!({"kept": {"n": 1}}));
}

#[test]
fn closed_database_rejects_every_operation() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("k", 1i64)).unwrap();
    db.close();

    assert!(matches!(db.view(), Err(Error::Closed)));
    assert!(matches!(db.size(), Err(Error::Closed)));
    assert!(matches!(db.sync(), Err(Error::Closed)));
    assert!(matches!(
        db.transaction(|root| root.set("k", 2i64)),
        Err(Error::Closed)
    ));
    assert!(matches!(db.compact(), Err(Error::Closed)));
}

#[test]
fn rollback_on_error_publishes_nothing() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("k", 1i64)).unwrap();
    let size = db.size().unwrap();
    let root_addr = db.view().unwrap().addr().unwrap();

    let result: kodama::Result<()> = db.transaction(|root| {
        root.set("k", 2i64)?;
        Err(Error::Io(std::io::Error::other("boom")))
    });
    assert!(result.is_err());

    assert_eq!(db.view().unwrap().to_json().unwrap(), json!({"k": 1}));
    assert_eq!(db.size().unwrap(), size);
    assert_eq!(db.view().unwrap().addr().unwrap(), root_addr);
}

#[test]
fn nested_transactions_are_rejected() {
    let (_dir, db) = open_temp();
    let result = db.transaction(|_root| db.transaction(|_inner| Ok(())));
    assert!(matches!(result, Err(Error::NestedTransaction)));

    // The gate is released again afterwards.
    db.transaction(|root| root.set("k", 1i64)).unwrap();
    assert_eq!(db.view().unwrap().to_json().unwrap(), json!({"k": 1}));
}

#[test]
fn read_views_reject_mutation() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("score", Value::from_json(&json!({"top": 8}))))
        .unwrap();

    let view = db.view().unwrap();
    assert!(matches!(view.set("k", 1i64), Err(Error::ReadOnlyView)));
    assert!(matches!(view.remove("score"), Err(Error::ReadOnlyView)));

    let child = view.get("score").unwrap().unwrap();
    assert!(matches!(
        child.as_map().unwrap().set("top", 9i64),
        Err(Error::ReadOnlyView)
    ));
}

#[test]
fn string_sentinel_round_trips() {
    let (_dir, db) = open_temp();
    let strings = ["|hi", "deadbeef", "00000009", "9", "", "|", "plain text"];
    db.transaction(|root| {
        for (i, s) in strings.iter().enumerate() {
            root.set(format!("s{i}"), *s)?;
        }
        Ok(())
    })
    .unwrap();

    let view = db.view().unwrap();
    for (i, s) in strings.iter().enumerate() {
        let value = view.get(&format!("s{i}")).unwrap().unwrap();
        assert_eq!(value.as_str().unwrap(), *s);
    }
}

#[test]
fn compaction_preserves_content_and_shrinks() {
    let (_dir, db) = open_temp();
    db.transaction(|root| {
        root.set("people", Value::from_json(&json!(["Jim", "Phil"])))?;
        root.set("score", Value::from_json(&json!({"top": 8})))
    })
    .unwrap();
    // Garbage accumulates from rewritten roots.
    for i in 0..20i64 {
        db.transaction(|root| root.set("n", i)).unwrap();
    }
    let expected = db.view().unwrap().to_json().unwrap();
    let old_size = db.size().unwrap();

    let db = db.compact().unwrap();
    assert!(db.size().unwrap() < old_size);
    assert_eq!(db.view().unwrap().to_json().unwrap(), expected);

    // Rewriting the same tree after compaction is a no-op.
    let size = db.size().unwrap();
    db.transaction(|root| root.set("score", Value::from_json(&json!({"top": 8}))))
        .unwrap();
    assert_eq!(db.size().unwrap(), size);
}

#[test]
fn compaction_closes_the_old_handle() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("k", 1i64)).unwrap();
    let compacted = db.compact().unwrap();

    assert!(db.is_closed());
    assert!(matches!(db.view(), Err(Error::Closed)));
    assert_eq!(
        compacted.view().unwrap().to_json().unwrap(),
        json!({"k": 1})
    );
}

#[test]
fn orphaned_tail_bytes_are_benign() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let db = Database::open(&path).unwrap();
    db.transaction(|root| root.set("k", Value::from_json(&json!({"n": 1}))))
        .unwrap();
    let expected = db.view().unwrap().to_json().unwrap();
    db.close();

    // Records appended by an interrupted transaction never get named by
    // the header; simulate them with a raw tail write.
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"{\"half\":\"|writ").unwrap();
    drop(file);

    let db = Database::open(&path).unwrap();
    assert_eq!(db.view().unwrap().to_json().unwrap(), expected);

    // The database keeps working past the orphaned bytes.
    db.transaction(|root| root.set("more", 2i64)).unwrap();
    assert_eq!(db.view().unwrap().get("more").unwrap().unwrap().to_json().unwrap(), json!(2));
}

#[test]
fn destroy_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let db = Database::open(&path).unwrap();
    db.transaction(|root| root.set("k", 1i64)).unwrap();
    assert!(path.exists());

    db.destroy().unwrap();
    assert!(!path.exists());
}

#[test]
fn concurrent_readers_and_writers() {
    let (_dir, db) = open_temp();
    db.transaction(|root| root.set("counter", 0i64)).unwrap();
    let db = Arc::new(db);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                db.transaction(|root| {
                    let current: i64 = root.get("counter")?.unwrap().into_serde()?;
                    root.set("counter", current + 1)
                })
                .unwrap();
            }
        }));
    }
    for _ in 0..2 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for _ in 0..50 {
                let view = db.view().unwrap();
                let value: i64 = view.get("counter").unwrap().unwrap().into_serde().unwrap();
                assert!((0..=100).contains(&value));
                // The snapshot keeps answering the same thing.
                let again: i64 = view.get("counter").unwrap().unwrap().into_serde().unwrap();
                assert_eq!(value, again);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let total: i64 = db
        .view()
        .unwrap()
        .get("counter")
        .unwrap()
        .unwrap()
        .into_serde()
        .unwrap();
    assert_eq!(total, 100);
}

fn child_map(parent: &Node, key: &str) -> Node {
    match parent.get(key).unwrap() {
        Some(value) => value.as_map().unwrap().clone(),
        None => {
            let node = Node::detached();
            parent.set(key, node.clone()).unwrap();
            node
        }
    }
}

#[test]
fn large_workload_survives_compaction() {
    let (_dir, db) = open_temp();

    // 10 000 keys at depth 5, inserted across 100 transactions.
    for txn in 0..100u32 {
        db.transaction(|root| {
            for slot in 0..100u32 {
                let idx = txn * 100 + slot;
                let digits: Vec<u32> = (0..5u32).map(|d| idx / 10u32.pow(4 - d) % 10).collect();
                let level1 = child_map(root, &format!("a{}", digits[0]));
                let level2 = child_map(&level1, &format!("b{}", digits[1]));
                let level3 = child_map(&level2, &format!("c{}", digits[2]));
                let level4 = child_map(&level3, &format!("d{}", digits[3]));
                level4.set(format!("k{}", digits[4]), i64::from(idx))?;
            }
            Ok(())
        })
        .unwrap();
    }

    let db = db.compact().unwrap();

    let root = db.view().unwrap();
    for idx in 0..10_000u32 {
        let digits: Vec<u32> = (0..5u32).map(|d| idx / 10u32.pow(4 - d) % 10).collect();
        let mut node = root.clone();
        for (level, prefix) in ["a", "b", "c", "d"].iter().enumerate() {
            node = node
                .get(&format!("{prefix}{}", digits[level]))
                .unwrap()
                .unwrap()
                .as_map()
                .unwrap()
                .clone();
        }
        let value: i64 = node
            .get(&format!("k{}", digits[4]))
            .unwrap()
            .unwrap()
            .into_serde()
            .unwrap();
        assert_eq!(value, i64::from(idx));
    }
}
