//! The SQLite store must migrate a legacy store to the same state as the
//! in-memory reference adapter, and keep its checkpoint across reopen.

use scribe_core::adapter::{MemoryStore, SqliteStore, VersionStore};
use scribe_core::record::collections;
use scribe_core::runner::MigrationRunner;
use scribe_core::steps::{self, LATEST_VERSION};
use tempfile::TempDir;

use fixtures::*;

#[test]
fn sqlite_matches_memory_after_full_run() {
    let registry = steps::default_registry().expect("registry");

    let memory = MemoryStore::new();
    seed_legacy_store(&memory).expect("seed memory");
    MigrationRunner::new(&registry, &memory, &memory)
        .run(LATEST_VERSION)
        .expect("memory run");

    let dir = TempDir::new().expect("temp dir");
    let sqlite = SqliteStore::open(&dir.path().join("store.sqlite3")).expect("open");
    seed_legacy_store(&sqlite).expect("seed sqlite");
    MigrationRunner::new(&registry, &sqlite, &sqlite)
        .run(LATEST_VERSION)
        .expect("sqlite run");

    for ((name, expected), (_, actual)) in snapshot(&memory).into_iter().zip(snapshot(&sqlite)) {
        assert_eq!(actual, expected, "collection {name} diverged");
    }
    assert_eq!(
        sqlite.read_version().expect("version"),
        memory.read_version().expect("version")
    );
    assert_eq!(
        sqlite.collection_counts().expect("counts"),
        memory.collection_counts().expect("counts")
    );
}

#[test]
fn checkpoint_survives_reopen() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("nested/store.sqlite3");
    let registry = steps::default_registry().expect("registry");

    {
        let store = SqliteStore::open(&path).expect("open");
        seed_legacy_store(&store).expect("seed");
        let report = MigrationRunner::new(&registry, &store, &store)
            .run(15)
            .expect("run to 15");
        assert_eq!(report.to_version, 15);
    }

    let store = SqliteStore::open(&path).expect("reopen");
    assert_eq!(store.read_version().expect("version"), Some(15));
    let runner = MigrationRunner::new(&registry, &store, &store);
    assert_eq!(runner.pending(LATEST_VERSION).expect("pending"), vec![16]);

    let report = runner.run(LATEST_VERSION).expect("resume");
    assert_eq!(report.from_version, 15);
    assert_eq!(report.applied.len(), 1);
    assert!(runner.run(LATEST_VERSION).expect("noop").is_noop());

    let messages = rows(&store, collections::MESSAGES);
    assert_eq!(ids(&messages), vec!["$old", "$d", "$a", "$b"]);
    assert_eq!(messages[2]["replaceToId"], serde_json::json!("$e1"));
}

#[test]
fn in_memory_sqlite_starts_unversioned() {
    let store = SqliteStore::open_in_memory().expect("open");
    assert_eq!(store.read_version().expect("version"), None);
    let registry = steps::default_registry().expect("registry");
    let report = MigrationRunner::new(&registry, &store, &store)
        .run(LATEST_VERSION)
        .expect("run");
    assert_eq!(report.to_version, LATEST_VERSION);
    assert!(rows(&store, collections::MESSAGES).is_empty());
}
