//! Export determinism and round-trip properties, exercised against real
//! SQLite stores in temp dirs.

use std::sync::Arc;

use beads::core::DepKind;
use beads::journal;
use beads::paths::BeadsPaths;
use beads::store::{IssuePatch, NewIssue, SqliteStore, StoreBackend};

fn fresh_store(tag: &str) -> (tempfile::TempDir, BeadsPaths, Arc<SqliteStore>) {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join(".beads");
    std::fs::create_dir_all(&base).unwrap();
    let paths = BeadsPaths::at(base);
    let store = Arc::new(SqliteStore::init(&paths.db(), tag).unwrap());
    (tmp, paths, store)
}

fn populate(store: &SqliteStore) {
    let a = store
        .create(NewIssue {
            title: "First: escape \"quotes\" and\nnewlines".into(),
            description: "long\nmultiline\ndescription".into(),
            ..Default::default()
        })
        .unwrap();
    let b = store
        .create(NewIssue {
            title: "Second".into(),
            external_ref: Some("https://example.com/tickets/7".into()),
            ..Default::default()
        })
        .unwrap();
    store.add_dep(&b.id, &a.id, DepKind::Blocks).unwrap();
    store.add_dep(&b.id, &a.id, DepKind::RelatedTo).unwrap();
    store.close(&a.id, Some("fixed".into())).unwrap();
    store
        .update(
            &b.id,
            IssuePatch {
                priority: Some(beads::Priority::HIGHEST),
                ..Default::default()
            },
        )
        .unwrap();
}

#[test]
fn export_is_deterministic() {
    let (_tmp, paths, store) = fresh_store("bd");
    populate(&store);

    journal::export(store.as_ref(), &paths).unwrap();
    let first = std::fs::read_to_string(paths.journal()).unwrap();

    // Re-export over the same state: identical bytes, skipped rename.
    let outcome = journal::export(store.as_ref(), &paths).unwrap();
    assert!(!outcome.written, "identical content must skip the rename");
    let second = std::fs::read_to_string(paths.journal()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn export_import_export_roundtrips_bytes() {
    let (_tmp_a, paths_a, store_a) = fresh_store("bd");
    populate(&store_a);
    journal::export(store_a.as_ref(), &paths_a).unwrap();
    let original = std::fs::read_to_string(paths_a.journal()).unwrap();

    // Import into a fresh store, then export from there.
    let (_tmp_b, paths_b, store_b) = fresh_store("bd");
    let report =
        journal::import_file(store_b.as_ref(), &paths_b, &paths_a.journal()).unwrap();
    assert_eq!(report.inserted, 2);
    assert!(report.malformed.is_empty());
    assert!(report.dangling.is_empty());

    journal::export(store_b.as_ref(), &paths_b).unwrap();
    let roundtripped = std::fs::read_to_string(paths_b.journal()).unwrap();
    assert_eq!(original, roundtripped);
}

#[test]
fn reimport_of_own_journal_is_a_noop() {
    let (_tmp, paths, store) = fresh_store("bd");
    populate(&store);
    journal::export(store.as_ref(), &paths).unwrap();
    let before = std::fs::read_to_string(paths.journal()).unwrap();

    let report = journal::import(store.as_ref(), &paths).unwrap();
    assert_eq!(report.changed(), 0, "own journal must be entirely stale");

    let outcome = journal::export(store.as_ref(), &paths).unwrap();
    assert!(!outcome.written);
    assert_eq!(before, std::fs::read_to_string(paths.journal()).unwrap());
}

#[test]
fn missing_journal_imports_as_empty() {
    let (_tmp, paths, store) = fresh_store("bd");
    let report = journal::import(store.as_ref(), &paths).unwrap();
    assert_eq!(report.changed(), 0);
}
