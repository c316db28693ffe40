//! Integration tests for the stream driver.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use tidemark::stream::StreamReconciler;
use tidemark_core::{
    CurrentStateStore, FieldValue, HistoryStore, MemoryStore, Payload, ReconcileConfig, RecordKey,
    Revision, Sequence, SourceTag,
};

fn config(window: usize, shards: usize) -> Arc<ReconcileConfig> {
    Arc::new(ReconcileConfig {
        reorder_window: window,
        shard_count: shards,
        ..ReconcileConfig::default()
    })
}

fn job(key: &str, seq: u64, value: &str) -> Revision {
    Revision::upsert(
        RecordKey::new(key),
        Sequence::Counter(seq),
        Payload::new().with("job", FieldValue::text(value)),
        SourceTag::new("mssql"),
    )
}

// =============================================================================
// ORDERING
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_order_within_window_is_reordered() {
    let store = Arc::new(MemoryStore::new());
    let stream = StreamReconciler::start(Arc::clone(&store), config(8, 4));

    stream.submit(job("u1", 3, "captain")).await.unwrap();
    stream.submit(job("u1", 1, "cadet")).await.unwrap();
    stream.submit(job("u1", 2, "pilot")).await.unwrap();

    let summary = stream.finish().await;
    assert!(summary.is_clean());
    assert_eq!(summary.received, 3);
    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.updated, 2);
    assert_eq!(summary.counts.stale, 0);

    let key = RecordKey::new("u1");
    let versions = store.list_versions(&key).unwrap();
    assert_eq!(versions.len(), 3);
    assert_eq!(versions[0].valid_from, Sequence::Counter(1));
    assert_eq!(versions[0].valid_to, Some(Sequence::Counter(2)));
    assert_eq!(versions[2].valid_to, None);

    let row = store.get(&key).unwrap().unwrap();
    assert_eq!(row.payload.get("job"), Some(&FieldValue::text("captain")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_window_discards_late_arrivals() {
    let store = Arc::new(MemoryStore::new());
    let stream = StreamReconciler::start(Arc::clone(&store), config(0, 2));

    stream.submit(job("u1", 3, "captain")).await.unwrap();
    stream.submit(job("u1", 1, "cadet")).await.unwrap();

    let summary = stream.finish().await;
    assert_eq!(summary.counts.inserted, 1);
    assert_eq!(summary.counts.stale, 1);

    let row = store.get(&RecordKey::new("u1")).unwrap().unwrap();
    assert_eq!(row.sequence, Sequence::Counter(3));
    assert_eq!(store.version_count().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_sequence_sources_merge_field_by_field() {
    // Window 1 releases the group on overflow, window 8 on drain.
    for window in [1, 8] {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(ReconcileConfig {
            reorder_window: window,
            shard_count: 2,
            ..ReconcileConfig::user_identity()
        });
        let stream = StreamReconciler::start(Arc::clone(&store), config);

        let profile = |source: &str, email: &str, job: &str| {
            Revision::upsert(
                RecordKey::new("u1"),
                Sequence::Counter(5),
                Payload::new()
                    .with("email", FieldValue::text(email))
                    .with("job", FieldValue::text(job)),
                SourceTag::new(source),
            )
        };
        stream
            .submit(profile("mongodb", "m@x.com", "chef"))
            .await
            .unwrap();
        stream
            .submit(profile("mssql", "s@x.com", "pilot"))
            .await
            .unwrap();

        let summary = stream.finish().await;
        assert!(summary.is_clean());
        assert_eq!(summary.counts.inserted, 1, "window {window}");
        assert_eq!(summary.counts.total(), 1, "window {window}");
        assert_eq!(summary.superseded, 1);
        assert_eq!(summary.conflicts, 2);

        let row = store.get(&RecordKey::new("u1")).unwrap().unwrap();
        assert_eq!(row.payload.get("email"), Some(&FieldValue::text("m@x.com")));
        assert_eq!(row.payload.get("job"), Some(&FieldValue::text("pilot")));
        assert_eq!(store.version_count().unwrap(), 1);
    }
}

// =============================================================================
// FAILURE ISOLATION
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_unorderable_sequence_halts_only_its_key() {
    let store = Arc::new(MemoryStore::new());
    let stream = StreamReconciler::start(Arc::clone(&store), config(0, 1));

    let mut broken = job("bad", 0, "pilot");
    broken.sequence = Sequence::parse("next tuesday");

    stream.submit(job("bad", 1, "cadet")).await.unwrap();
    stream.submit(broken).await.unwrap();
    stream.submit(job("bad", 3, "captain")).await.unwrap();
    stream.submit(job("good", 1, "cadet")).await.unwrap();
    stream.submit(job("good", 2, "pilot")).await.unwrap();

    let summary = stream.finish().await;
    assert!(!summary.is_clean());
    assert_eq!(summary.received, 5);
    assert_eq!(summary.halted.len(), 1);
    assert!(summary.halted.contains_key(&RecordKey::new("bad")));
    assert_eq!(summary.skipped, 1);

    let bad = store.get(&RecordKey::new("bad")).unwrap().unwrap();
    assert_eq!(bad.sequence, Sequence::Counter(1));
    let good = store.get(&RecordKey::new("good")).unwrap().unwrap();
    assert_eq!(good.payload.get("job"), Some(&FieldValue::text("pilot")));
}

// =============================================================================
// DUPLICATES AND DELETES
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_redelivered_revisions_are_dropped_in_buffer() {
    let store = Arc::new(MemoryStore::new());
    let stream = StreamReconciler::start(Arc::clone(&store), config(4, 2));

    stream.submit(job("u1", 1, "cadet")).await.unwrap();
    stream.submit(job("u1", 1, "cadet")).await.unwrap();
    stream.submit(job("u1", 2, "pilot")).await.unwrap();

    let summary = stream.finish().await;
    assert_eq!(summary.duplicates_dropped, 1);
    assert_eq!(summary.counts.changed(), 2);
    assert_eq!(store.version_count().unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_closes_history_across_shards() {
    let store = Arc::new(MemoryStore::new());
    let stream = StreamReconciler::start(Arc::clone(&store), config(2, 3));

    for key in ["a", "b", "c", "d"] {
        stream.submit(job(key, 1, "cadet")).await.unwrap();
    }
    stream
        .submit(Revision::delete(
            RecordKey::new("c"),
            Sequence::Counter(2),
            SourceTag::new("mssql"),
        ))
        .await
        .unwrap();

    let summary = stream.finish().await;
    assert!(summary.is_clean());
    assert_eq!(summary.counts.inserted, 4);
    assert_eq!(summary.counts.deleted, 1);

    assert_eq!(store.row_count().unwrap(), 3);
    assert!(store.get(&RecordKey::new("c")).unwrap().is_none());
    let versions = store.list_versions(&RecordKey::new("c")).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].valid_to, Some(Sequence::Counter(2)));
}
