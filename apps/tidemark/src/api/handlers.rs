//! # API Endpoint Handlers
//!
//! Reads go straight to the store; the store commits per key, so no lock
//! is taken. Event batches run the pipeline on a blocking thread.

use super::{
    AppState,
    types::{
        AuditResponse, CurrentResponse, ExportResponse, FeedResponse, HealthResponse,
        HistoryQuery, HistoryResponse, KeyAuditJson, KeyAuditResponse, RevisionsRequest,
        RevisionsResponse, StatusResponse,
    },
};
use crate::reporting::log_pass_report;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tidemark_core::{
    AuditProjector, CurrentStateStore, HistoryStore, RecordKey, Sequence, TidemarkError,
    dump_store, dump_to_bytes,
};

/// 500 with a JSON `{"error": ...}` body.
fn error_response(msg: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// STATUS HANDLER
// =============================================================================

/// Table sizes and engine settings.
pub async fn status_handler(State(state): State<AppState>) -> Response {
    let store = state.pipeline.store();
    let config = state.pipeline.config();

    let counts = store.row_count().and_then(|rows| {
        let versions = store.version_count()?;
        let keys = store.history_keys()?.len();
        Ok((rows, versions, keys))
    });

    match counts {
        Ok((row_count, version_count, history_keys)) => (
            StatusCode::OK,
            Json(StatusResponse {
                backend: store.name().to_string(),
                row_count,
                version_count,
                history_keys,
                shard_count: config.shard_count,
                reorder_window: config.reorder_window,
            }),
        )
            .into_response(),
        Err(e) => error_response(format!("Status failed: {}", e)),
    }
}

// =============================================================================
// CURRENT STATE HANDLER
// =============================================================================

/// Current-state row of one key.
pub async fn current_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.pipeline.store().get(&RecordKey::new(key)) {
        Ok(Some(row)) => (StatusCode::OK, Json(CurrentResponse::found(&row))),
        Ok(None) => (StatusCode::NOT_FOUND, Json(CurrentResponse::not_found())),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(CurrentResponse::error(format!("Lookup failed: {}", e))),
        ),
    }
}

// =============================================================================
// HISTORY HANDLER
// =============================================================================

/// Every version of one key, or only the one valid at `as_of`.
pub async fn history_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let record_key = RecordKey::new(key.clone());
    let store = state.pipeline.store();

    let versions = match store.list_versions(&record_key) {
        Ok(versions) if versions.is_empty() => {
            return (
                StatusCode::NOT_FOUND,
                Json(HistoryResponse::error(key, "No history for key")),
            );
        }
        Ok(versions) => versions,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HistoryResponse::error(key, format!("Lookup failed: {}", e))),
            );
        }
    };

    let Some(as_of) = query.as_of else {
        return (
            StatusCode::OK,
            Json(HistoryResponse::with_versions(key, &versions)),
        );
    };

    let at = Sequence::parse(&as_of);
    if !at.is_orderable() {
        return (
            StatusCode::BAD_REQUEST,
            Json(HistoryResponse::error(
                key,
                format!("Invalid as_of sequence '{}'", as_of),
            )),
        );
    }
    let covering: Vec<_> = versions.into_iter().filter(|v| v.covers(&at)).collect();
    (
        StatusCode::OK,
        Json(HistoryResponse::with_versions(key, &covering)),
    )
}

// =============================================================================
// AUDIT HANDLERS
// =============================================================================

/// Audit summary over every key.
pub async fn audit_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.audit() {
        Ok(report) => (StatusCode::OK, Json(AuditResponse::from(&report))).into_response(),
        Err(e) => error_response(format!("Audit failed: {}", e)),
    }
}

/// Audit summary of one key.
pub async fn audit_key_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    let record_key = RecordKey::new(key);
    let store = state.pipeline.store();

    let versions = match store.list_versions(&record_key) {
        Ok(versions) => versions,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(KeyAuditResponse {
                    found: false,
                    audit: None,
                    error: Some(format!("Audit failed: {}", e)),
                }),
            );
        }
    };
    if versions.is_empty() {
        return (
            StatusCode::NOT_FOUND,
            Json(KeyAuditResponse {
                found: false,
                audit: None,
                error: None,
            }),
        );
    }

    let audit = AuditProjector::new(&state.pipeline.config().audit)
        .project_versions(&record_key, &versions);
    (
        StatusCode::OK,
        Json(KeyAuditResponse {
            found: true,
            audit: Some(KeyAuditJson::from(&audit)),
            error: None,
        }),
    )
}

// =============================================================================
// FEED HANDLER
// =============================================================================

/// Change-feed metrics of the last pass run through this server.
pub async fn feed_handler(State(state): State<AppState>) -> impl IntoResponse {
    let last = state.last_feed.read().await;
    let response = last.as_ref().map(FeedResponse::from).unwrap_or_default();
    (StatusCode::OK, Json(response))
}

// =============================================================================
// REVISIONS HANDLER
// =============================================================================

/// Reconcile a batch of events.
pub async fn revisions_handler(
    State(state): State<AppState>,
    Json(request): Json<RevisionsRequest>,
) -> impl IntoResponse {
    let records = match request.to_records() {
        Ok(records) => records,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(RevisionsResponse::error(format!("Invalid batch: {}", e))),
            );
        }
    };

    let pipeline = Arc::clone(&state.pipeline);
    let outcome = tokio::task::spawn_blocking(move || pipeline.run_events(&records)).await;

    match outcome {
        Ok(Ok(report)) => {
            log_pass_report(&report);
            *state.last_feed.write().await = Some(report.feed.clone());
            (StatusCode::OK, Json(RevisionsResponse::from_report(&report)))
        }
        Ok(Err(e @ TidemarkError::BatchTooLarge { .. })) => (
            StatusCode::BAD_REQUEST,
            Json(RevisionsResponse::error(format!("Invalid batch: {}", e))),
        ),
        Ok(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RevisionsResponse::error(format!("Reconcile failed: {}", e))),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Reconcile task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RevisionsResponse::error("Reconcile task failed")),
            )
        }
    }
}

// =============================================================================
// EXPORT HANDLER
// =============================================================================

/// Export both tables as a base64 TDMK dump.
pub async fn export_handler(State(state): State<AppState>) -> impl IntoResponse {
    let dump = match dump_store(state.pipeline.store()) {
        Ok(dump) => dump,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ExportResponse::error(format!("Dump failed: {}", e))),
            );
        }
    };

    match dump_to_bytes(&dump) {
        Ok(data) => (
            StatusCode::OK,
            Json(ExportResponse::success(&data, dump.len())),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExportResponse::error(format!("Export failed: {}", e))),
        ),
    }
}
