//! Unit tests for API types serialization/deserialization.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use serde_json::json;
use tidemark::api::{
    CurrentResponse, ExportResponse, FeedResponse, HealthResponse, HistoryResponse,
    RevisionsRequest, RevisionsResponse, VersionJson,
};
use tidemark_core::{
    CurrentStateRow, FeedMetrics, FieldValue, HistoryVersion, Payload, RecordKey, Revision,
    Sequence, SourceTag, TidemarkError, primitives::MAX_BATCH_LENGTH,
};

// =============================================================================
// HEALTH RESPONSE TESTS
// =============================================================================

#[test]
fn test_health_response_default() {
    let health = HealthResponse::default();
    assert_eq!(health.status, "ok");
    assert!(!health.version.is_empty());
}

#[test]
fn test_health_response_deserialization() {
    let json = r#"{"status":"healthy","version":"1.0.0"}"#;
    let health: HealthResponse = serde_json::from_str(json).unwrap();

    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, "1.0.0");
}

// =============================================================================
// CURRENT / HISTORY TESTS
// =============================================================================

#[test]
fn test_current_row_renders_payload_as_object() {
    let row = CurrentStateRow {
        key: RecordKey::new("111"),
        payload: Payload::new()
            .with("job", FieldValue::text("pilot"))
            .with("age", FieldValue::Int(41))
            .with("city", FieldValue::Null),
        sequence: Sequence::Counter(7),
    };

    let json = serde_json::to_value(CurrentResponse::found(&row)).unwrap();
    assert_eq!(json["found"], json!(true));
    assert_eq!(json["row"]["sequence"], json!("7"));
    assert_eq!(json["row"]["payload"]["job"], json!("pilot"));
    assert_eq!(json["row"]["payload"]["age"], json!(41));
    assert_eq!(json["row"]["payload"]["city"], json!(null));
}

#[test]
fn test_current_not_found_has_no_row() {
    let json = serde_json::to_value(CurrentResponse::not_found()).unwrap();
    assert_eq!(json["found"], json!(false));
    assert!(json["row"].is_null());
    assert!(json["error"].is_null());
}

#[test]
fn test_open_version_is_current() {
    let version = HistoryVersion::open(
        RecordKey::new("111"),
        Payload::new().with("job", FieldValue::text("cadet")),
        Sequence::Counter(1),
    );

    let rendered = VersionJson::from(&version);
    assert!(rendered.current);
    assert!(!rendered.deleted);
    assert_eq!(rendered.valid_from, "1");
    assert_eq!(rendered.valid_to, None);
}

#[test]
fn test_history_error_carries_key() {
    let response = HistoryResponse::error("111", "No history for key");
    assert!(!response.success);
    assert_eq!(response.key, "111");
    assert!(response.versions.is_empty());
}

// =============================================================================
// REVISIONS REQUEST TESTS
// =============================================================================

#[test]
fn test_revisions_request_default_source() {
    let request: RevisionsRequest = serde_json::from_value(json!({
        "records": [
            {"cpf": "1", "sequence": 1},
            {"cpf": "2", "sequence": 1, "source_system": "mssql"}
        ]
    }))
    .unwrap();

    let records = request.to_records().unwrap();
    assert_eq!(records[0].source, SourceTag::new("api"));
    assert_eq!(records[1].source, SourceTag::new("mssql"));
}

#[test]
fn test_revisions_request_explicit_source() {
    let request = RevisionsRequest {
        source: Some("mongodb".to_string()),
        records: vec![json!({"cpf": "1"})],
    };

    let records = request.to_records().unwrap();
    assert_eq!(records[0].source, SourceTag::new("mongodb"));
}

#[test]
fn test_revisions_request_too_large() {
    let request = RevisionsRequest {
        source: None,
        records: vec![json!({}); MAX_BATCH_LENGTH + 1],
    };

    assert!(matches!(
        request.to_records(),
        Err(TidemarkError::BatchTooLarge { .. })
    ));
}

#[test]
fn test_revisions_error_response() {
    let response = RevisionsResponse::error("bad batch");
    assert!(!response.success);
    assert_eq!(response.counts.total(), 0);
    assert_eq!(response.error.as_deref(), Some("bad batch"));
}

// =============================================================================
// FEED / EXPORT TESTS
// =============================================================================

#[test]
fn test_feed_response_from_metrics() {
    let source = SourceTag::new("mssql");
    let revisions = vec![
        Revision::upsert(
            RecordKey::new("1"),
            Sequence::Counter(1),
            Payload::new(),
            source.clone(),
        ),
        Revision::delete(RecordKey::new("1"), Sequence::Counter(4), source),
    ];

    let feed = FeedResponse::from(&FeedMetrics::observe(&revisions));
    assert!(feed.available);
    assert_eq!(feed.total_events, 2);
    assert_eq!(feed.deletes, 1);
    let mssql = &feed.by_source["mssql"];
    assert_eq!(mssql.min_sequence.as_deref(), Some("1"));
    assert_eq!(mssql.max_sequence.as_deref(), Some("4"));
    assert_eq!(mssql.counter_gaps, 2);
    assert_eq!(feed.total_gaps, 2);
}

#[test]
fn test_feed_response_default_unavailable() {
    let feed = FeedResponse::default();
    assert!(!feed.available);
    assert_eq!(feed.total_events, 0);
}

#[test]
fn test_export_response_success_is_base64() {
    let response = ExportResponse::success(b"TDMK", 3);
    assert!(response.success);
    assert_eq!(response.data.as_deref(), Some("VERNSw=="));
    assert_eq!(response.slot_count, Some(3));
}
