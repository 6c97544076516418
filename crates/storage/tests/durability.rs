//! Durability and transaction scenarios that span process "restarts"
//! (dropping and reopening the database over the same directory).

use tissdb_model::{Document, FieldType, Schema};
use tissdb_storage::{CollectionOptions, Database, StorageError};

fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

fn open(dir: &std::path::Path) -> Database {
    Database::open("test", dir, CollectionOptions::default()).unwrap()
}

#[test]
fn committed_put_survives_restart_without_flush() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        db.create_collection("users", None).unwrap();

        let txn = db.begin_transaction();
        db.put(
            "users",
            "u1",
            Document::new("u1").with("name", "ada"),
            Some(txn),
        )
        .unwrap();
        db.commit_transaction(txn).unwrap();
        // Dropped here: no flush, no checkpoint. Only WALs hold the data.
    }
    let db = open(dir.path());
    let doc = db.get("users", "u1", None).unwrap().expect("u1 after restart");
    assert_eq!(doc.get("name").unwrap().canonical_text().unwrap(), "ada");
}

#[test]
fn uncommitted_transaction_vanishes_on_restart() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        db.create_collection("users", None).unwrap();
        db.put("users", "base", Document::new("base"), None).unwrap();

        let txn = db.begin_transaction();
        db.put("users", "ghost", Document::new("ghost"), Some(txn))
            .unwrap();
        db.delete("users", "base", Some(txn)).unwrap();
        // Crash before commit.
    }
    let db = open(dir.path());
    assert!(db.get("users", "ghost", None).unwrap().is_none());
    assert!(db.get("users", "base", None).unwrap().is_some());
}

#[test]
fn rollback_discards_staged_ops() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection("kv", None).unwrap();
    db.put("kv", "b", Document::new("b").with("v", 1.0), None).unwrap();

    let txn = db.begin_transaction();
    db.put("kv", "a", Document::new("a"), Some(txn)).unwrap();
    db.delete("kv", "b", Some(txn)).unwrap();

    // Staged ops are visible only through the transaction.
    assert!(db.get("kv", "a", Some(txn)).unwrap().is_some());
    assert!(db.get("kv", "b", Some(txn)).unwrap().is_none());
    assert!(db.get("kv", "a", None).unwrap().is_none());

    db.rollback_transaction(txn);
    assert!(db.get("kv", "a", None).unwrap().is_none());
    assert!(db.get("kv", "b", None).unwrap().is_some());
}

#[test]
fn failed_commit_has_no_partial_effects() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection(
        "users",
        Some(
            Schema::new()
                .field("email", FieldType::String, true, true)
                .primary_key(["email"]),
        ),
    )
    .unwrap();
    db.put(
        "users",
        "u1",
        Document::new("u1").with("email", "taken@x"),
        None,
    )
    .unwrap();

    let txn = db.begin_transaction();
    db.put("users", "u2", Document::new("u2").with("email", "new@x"), Some(txn))
        .unwrap();
    db.put("users", "u3", Document::new("u3").with("email", "taken@x"), Some(txn))
        .unwrap();
    let err = db.commit_transaction(txn).unwrap_err();
    assert!(
        matches!(err, StorageError::PrimaryKey(_) | StorageError::Unique { .. }),
        "{err}"
    );

    // The valid first op must not have leaked.
    assert!(db.get("users", "u2", None).unwrap().is_none());
    assert!(!db.list_collections().is_empty());

    // The transaction is gone; committing again reports it.
    assert!(matches!(
        db.commit_transaction(txn),
        Err(StorageError::TransactionNotActive(_))
    ));
}

#[test]
fn unique_conflict_inside_one_transaction_aborts() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection(
        "users",
        Some(Schema::new().field("email", FieldType::String, true, true)),
    )
    .unwrap();

    let txn = db.begin_transaction();
    db.put("users", "u1", Document::new("u1").with("email", "dup@x"), Some(txn))
        .unwrap();
    db.put("users", "u2", Document::new("u2").with("email", "dup@x"), Some(txn))
        .unwrap();
    let err = db.commit_transaction(txn).unwrap_err();
    assert!(matches!(err, StorageError::Unique { .. }), "{err}");
    assert!(db.get("users", "u1", None).unwrap().is_none());
}

#[test]
fn foreign_keys_enforced_on_put_and_commit() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection("users", None).unwrap();
    db.create_collection(
        "orders",
        Some(
            Schema::new()
                .field("user_id", FieldType::String, true, false)
                .foreign_key("user_id", "users", "id"),
        ),
    )
    .unwrap();

    // A dangling reference is rejected.
    let err = db
        .put(
            "orders",
            "o1",
            Document::new("o1").with("user_id", "ghost"),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKey { .. }), "{err}");

    db.put("users", "u1", Document::new("u1"), None).unwrap();
    db.put(
        "orders",
        "o1",
        Document::new("o1").with("user_id", "u1"),
        None,
    )
    .unwrap();

    // A transaction may create the referenced row and the referencing row
    // together, in order.
    let txn = db.begin_transaction();
    db.put("users", "u2", Document::new("u2"), Some(txn)).unwrap();
    db.put(
        "orders",
        "o2",
        Document::new("o2").with("user_id", "u2"),
        Some(txn),
    )
    .unwrap();
    db.commit_transaction(txn).unwrap();
    assert!(db.get("orders", "o2", None).unwrap().is_some());

    // But a commit whose reference points at a row the same transaction
    // deletes must fail.
    let txn = db.begin_transaction();
    db.delete("users", "u1", Some(txn)).unwrap();
    db.put(
        "orders",
        "o3",
        Document::new("o3").with("user_id", "u1"),
        Some(txn),
    )
    .unwrap();
    assert!(matches!(
        db.commit_transaction(txn),
        Err(StorageError::ForeignKey { .. })
    ));
    assert!(db.get("users", "u1", None).unwrap().is_some());
}

#[test]
fn cross_collection_commit_is_atomic_across_restart() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        db.create_collection("accounts", None).unwrap();
        db.create_collection("ledger", None).unwrap();

        let txn = db.begin_transaction();
        db.put("accounts", "a1", Document::new("a1").with("balance", 90.0), Some(txn))
            .unwrap();
        db.put("ledger", "l1", Document::new("l1").with("delta", -10.0), Some(txn))
            .unwrap();
        db.commit_transaction(txn).unwrap();
    }
    let db = open(dir.path());
    assert_eq!(
        db.get("accounts", "a1", None).unwrap().unwrap().get("balance").unwrap().as_f64(),
        Some(90.0)
    );
    assert_eq!(
        db.get("ledger", "l1", None).unwrap().unwrap().get("delta").unwrap().as_f64(),
        Some(-10.0)
    );
}

#[test]
fn checkpoint_then_restart_serves_from_sstables() {
    enable_logging();
    let dir = tempfile::tempdir().unwrap();
    {
        let db = open(dir.path());
        db.create_collection("kv", None).unwrap();
        for i in 0..20 {
            db.put("kv", &format!("k{i:02}"), Document::new(format!("k{i:02}")).with("n", i as f64), None)
                .unwrap();
        }
        db.checkpoint().unwrap();
    }
    let db = open(dir.path());
    assert_eq!(db.scan("kv").unwrap().len(), 20);
    assert_eq!(
        db.get("kv", "k07", None).unwrap().unwrap().get("n").unwrap().as_f64(),
        Some(7.0)
    );
}
