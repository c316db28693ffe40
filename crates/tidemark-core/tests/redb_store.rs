//! # Persistent Backend Tests
//!
//! Full passes against redb, reopening the database between passes.

use tempfile::tempdir;
use tidemark_core::{
    ChangeStore, CurrentStateStore, FieldValue, HistoryStore, MemoryStore, Pipeline, RawRecord,
    ReconcileConfig, RecordKey, RedbStore, Sequence, StorageBackend, dump_from_bytes, dump_store,
    dump_to_bytes, restore_store,
};

fn row(cpf: &str, seq: i64, email: &str) -> RawRecord {
    RawRecord::new("mongodb")
        .field("cpf", FieldValue::text(cpf))
        .field("sequence", FieldValue::Int(seq))
        .field("email", FieldValue::text(email))
}

#[test]
fn passes_accumulate_across_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tables.redb");

    {
        let store = RedbStore::open(&path).expect("open");
        let pipeline = Pipeline::new(ReconcileConfig::default(), store).expect("pipeline");
        pipeline
            .run_events(&[row("1", 10, "a@x.com"), row("2", 10, "z@x.com")])
            .expect("first pass");
    }

    let store = RedbStore::open(&path).expect("reopen");
    let pipeline = Pipeline::new(ReconcileConfig::default(), store).expect("pipeline");
    let report = pipeline
        .run_events(&[row("1", 20, "b@x.com"), row("1", 5, "late@x.com")])
        .expect("second pass");

    assert_eq!(report.totals.updated, 1);
    assert_eq!(report.totals.stale, 1);

    let store = pipeline.store();
    let key = RecordKey::new("1");
    let versions = store.list_versions(&key).expect("versions");
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].valid_to, Some(Sequence::Counter(20)));
    assert_eq!(
        store.watermark(&key).expect("watermark").map(|w| w.sequence),
        Some(Sequence::Counter(20))
    );
    assert_eq!(store.row_count().expect("rows"), 2);
    assert_eq!(store.version_count().expect("versions"), 3);
}

#[test]
fn snapshot_deletes_survive_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tables.redb");
    let config = ReconcileConfig::default();

    {
        let backend = StorageBackend::with_redb(&path).expect("open");
        let pipeline = Pipeline::new(config.clone(), backend).expect("pipeline");
        let snapshot = |cpf: &str| {
            RawRecord::new("mongodb")
                .field("cpf", FieldValue::text(cpf))
                .field("email", FieldValue::text(format!("{cpf}@x.com")))
        };
        pipeline
            .run_snapshot(&[snapshot("1"), snapshot("2")], Sequence::Counter(1))
            .expect("t1");
        pipeline
            .run_snapshot(&[snapshot("1")], Sequence::Counter(2))
            .expect("t2");
    }

    let backend = StorageBackend::with_redb(&path).expect("reopen");
    assert!(backend.is_persistent());
    assert_eq!(backend.keys().expect("keys"), vec![RecordKey::new("1")]);
    let gone = backend
        .list_versions(&RecordKey::new("2"))
        .expect("versions");
    assert!(gone[0].deleted);
}

#[test]
fn dump_moves_tables_between_backends() {
    let dir = tempdir().expect("tempdir");
    let persistent = StorageBackend::with_redb(dir.path().join("tables.redb")).expect("open");
    let pipeline = Pipeline::new(ReconcileConfig::default(), persistent).expect("pipeline");
    pipeline
        .run_events(&[row("1", 1, "a@x.com"), row("1", 2, "b@x.com")])
        .expect("pass");

    let dump = dump_store(pipeline.store()).expect("dump");
    let bytes = dump_to_bytes(&dump).expect("encode");
    let restored = StorageBackend::from_dump(dump_from_bytes(&bytes).expect("decode"))
        .expect("restore");

    assert_eq!(restored.name(), "memory");
    assert_eq!(dump_store(&restored).expect("dump"), dump);
    assert_eq!(
        restored
            .version_at(&RecordKey::new("1"), &Sequence::Counter(1))
            .expect("as of")
            .map(|v| v.payload.get("email").cloned()),
        Some(Some(FieldValue::text("a@x.com")))
    );
}

#[test]
fn restore_replaces_existing_history() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tables.redb");
    let key = RecordKey::new("1");

    {
        let store = RedbStore::open(&path).expect("open");
        let pipeline = Pipeline::new(ReconcileConfig::default(), store).expect("pipeline");
        pipeline
            .run_events(&[
                row("1", 1, "a@x.com"),
                row("1", 2, "b@x.com"),
                row("1", 3, "c@x.com"),
            ])
            .expect("pass");
        assert_eq!(pipeline.store().list_versions(&key).expect("versions").len(), 3);

        let incoming = Pipeline::new(ReconcileConfig::default(), MemoryStore::new())
            .expect("pipeline");
        incoming
            .run_events(&[row("1", 10, "d@x.com")])
            .expect("pass");
        let dump = dump_store(incoming.store()).expect("dump");

        assert_eq!(restore_store(pipeline.store(), dump).expect("restore"), 1);
    }

    let store = RedbStore::open(&path).expect("reopen");
    let versions = store.list_versions(&key).expect("versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].valid_from, Sequence::Counter(10));
    assert!(versions[0].is_current());
    assert_eq!(
        versions[0].payload.get("email"),
        Some(&FieldValue::text("d@x.com"))
    );
    assert_eq!(store.version_count().expect("versions"), 1);
    assert_eq!(store.history_keys().expect("history keys"), vec![key.clone()]);
    assert_eq!(
        store.watermark(&key).expect("watermark").map(|w| w.sequence),
        Some(Sequence::Counter(10))
    );
}

#[test]
fn retracted_version_leaves_no_history() {
    let dir = tempdir().expect("tempdir");
    let store = RedbStore::open(dir.path().join("tables.redb")).expect("open");
    let pipeline = Pipeline::new(ReconcileConfig::user_identity(), store).expect("pipeline");
    let event = |source: &str| {
        RawRecord::new(source)
            .field("cpf", FieldValue::text("1"))
            .field("sequence", FieldValue::Int(7))
    };

    pipeline
        .run_events(&[event("mongodb").field("email", FieldValue::text("m@x.com"))])
        .expect("upsert");
    pipeline
        .run_events(&[event("mssql").field("operation", FieldValue::text("delete"))])
        .expect("delete");

    let store = pipeline.store();
    assert!(store.get(&RecordKey::new("1")).expect("get").is_none());
    assert_eq!(store.version_count().expect("versions"), 0);
    assert!(store.history_keys().expect("history keys").is_empty());
}
