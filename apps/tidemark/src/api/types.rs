//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.
//!
//! Payloads are rendered as plain JSON objects and sequences as their
//! display text (a counter, or an RFC 3339 timestamp).

use crate::input::{field_to_json, record_from_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tidemark_core::{
    ApplyCounts, AuditReport, CurrentStateRow, FeedMetrics, HistoryVersion, KeyAudit, PassReport,
    Payload, RawRecord, TidemarkError, primitives::MAX_BATCH_LENGTH,
};

/// Source tag given to records posted without a `source_system` field.
pub const DEFAULT_API_SOURCE: &str = "api";

fn payload_json(payload: &Payload) -> Map<String, Value> {
    payload
        .iter()
        .map(|(field, value)| (field.clone(), field_to_json(value)))
        .collect()
}

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// STATUS RESPONSE
// =============================================================================

/// Table status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub backend: String,
    pub row_count: usize,
    pub version_count: usize,
    pub history_keys: usize,
    pub shard_count: usize,
    pub reorder_window: usize,
}

// =============================================================================
// CURRENT STATE
// =============================================================================

/// One current-state row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowJson {
    pub key: String,
    pub sequence: String,
    pub payload: Map<String, Value>,
}

impl From<&CurrentStateRow> for RowJson {
    fn from(row: &CurrentStateRow) -> Self {
        Self {
            key: row.key.to_string(),
            sequence: row.sequence.to_string(),
            payload: payload_json(&row.payload),
        }
    }
}

/// Current-state lookup response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentResponse {
    pub found: bool,
    pub row: Option<RowJson>,
    pub error: Option<String>,
}

impl CurrentResponse {
    pub fn found(row: &CurrentStateRow) -> Self {
        Self {
            found: true,
            row: Some(RowJson::from(row)),
            error: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            found: false,
            row: None,
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            found: false,
            row: None,
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// HISTORY
// =============================================================================

/// Query string of `GET /history/{key}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Return only the version valid at this sequence.
    pub as_of: Option<String>,
}

/// One history version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionJson {
    pub valid_from: String,
    pub valid_to: Option<String>,
    pub deleted: bool,
    pub current: bool,
    pub payload: Map<String, Value>,
}

impl From<&HistoryVersion> for VersionJson {
    fn from(version: &HistoryVersion) -> Self {
        Self {
            valid_from: version.valid_from.to_string(),
            valid_to: version.valid_to.as_ref().map(ToString::to_string),
            deleted: version.deleted,
            current: version.is_current(),
            payload: payload_json(&version.payload),
        }
    }
}

/// History lookup response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub key: String,
    pub versions: Vec<VersionJson>,
    pub error: Option<String>,
}

impl HistoryResponse {
    pub fn with_versions(key: impl Into<String>, versions: &[HistoryVersion]) -> Self {
        Self {
            success: true,
            key: key.into(),
            versions: versions.iter().map(VersionJson::from).collect(),
            error: None,
        }
    }

    pub fn error(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            key: key.into(),
            versions: vec![],
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// AUDIT
// =============================================================================

/// Audit summary of one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAuditJson {
    pub key: String,
    pub versions: usize,
    pub transitions: u64,
    pub deletions: u64,
    pub categories: BTreeMap<String, u64>,
    pub tier: String,
    pub active: bool,
    pub first_seen: Option<String>,
    pub last_change: Option<String>,
}

impl From<&KeyAudit> for KeyAuditJson {
    fn from(audit: &KeyAudit) -> Self {
        Self {
            key: audit.key.to_string(),
            versions: audit.versions,
            transitions: audit.transitions,
            deletions: audit.deletions,
            categories: audit.categories.clone(),
            tier: audit.tier.name().to_string(),
            active: audit.active,
            first_seen: audit.first_seen.as_ref().map(ToString::to_string),
            last_change: audit.last_change.as_ref().map(ToString::to_string),
        }
    }
}

/// Whole-table audit response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResponse {
    pub key_count: usize,
    pub tier_counts: BTreeMap<String, usize>,
    pub category_totals: BTreeMap<String, u64>,
    pub total_transitions: u64,
    pub total_deletions: u64,
}

impl From<&AuditReport> for AuditResponse {
    fn from(report: &AuditReport) -> Self {
        Self {
            key_count: report.key_count(),
            tier_counts: report
                .tier_counts
                .iter()
                .map(|(tier, count)| (tier.name().to_string(), *count))
                .collect(),
            category_totals: report.category_totals.clone(),
            total_transitions: report.total_transitions,
            total_deletions: report.total_deletions,
        }
    }
}

/// Single-key audit response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAuditResponse {
    pub found: bool,
    pub audit: Option<KeyAuditJson>,
    pub error: Option<String>,
}

// =============================================================================
// FEED
// =============================================================================

/// Feed figures for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFeedJson {
    pub events: u64,
    pub upserts: u64,
    pub deletes: u64,
    pub min_sequence: Option<String>,
    pub max_sequence: Option<String>,
    pub counter_gaps: u64,
}

/// Change-feed metrics of the last pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedResponse {
    /// False until a pass has run since the server started.
    pub available: bool,
    pub total_events: u64,
    pub upserts: u64,
    pub deletes: u64,
    pub total_gaps: u64,
    pub by_source: BTreeMap<String, SourceFeedJson>,
}

impl From<&FeedMetrics> for FeedResponse {
    fn from(feed: &FeedMetrics) -> Self {
        Self {
            available: true,
            total_events: feed.total_events,
            upserts: feed.upserts,
            deletes: feed.deletes,
            total_gaps: feed.total_gaps(),
            by_source: feed
                .by_source
                .iter()
                .map(|(source, f)| {
                    (
                        source.to_string(),
                        SourceFeedJson {
                            events: f.events,
                            upserts: f.upserts,
                            deletes: f.deletes,
                            min_sequence: f.min_sequence.as_ref().map(ToString::to_string),
                            max_sequence: f.max_sequence.as_ref().map(ToString::to_string),
                            counter_gaps: f.counter_gaps,
                        },
                    )
                })
                .collect(),
        }
    }
}

// =============================================================================
// REVISIONS REQUEST/RESPONSE
// =============================================================================

/// Event batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionsRequest {
    /// Source for records without a `source_system` field.
    #[serde(default)]
    pub source: Option<String>,
    pub records: Vec<Value>,
}

impl RevisionsRequest {
    /// Convert to raw records, validating the batch size first.
    pub fn to_records(&self) -> Result<Vec<RawRecord>, TidemarkError> {
        if self.records.len() > MAX_BATCH_LENGTH {
            return Err(TidemarkError::BatchTooLarge {
                len: self.records.len(),
                max: MAX_BATCH_LENGTH,
            });
        }
        let source = self
            .source
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_API_SOURCE);
        self.records
            .iter()
            .map(|value| record_from_json(value.clone(), source))
            .collect()
    }
}

/// A record the normalizer rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionJson {
    pub ordinal: usize,
    pub source: String,
    pub reason: String,
}

/// A key whose stream halted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureJson {
    pub key: String,
    pub reason: String,
    pub skipped: usize,
}

/// Event batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionsResponse {
    pub success: bool,
    pub accepted: u64,
    pub counts: ApplyCounts,
    pub rejected: Vec<RejectionJson>,
    pub failed_keys: Vec<FailureJson>,
    pub duplicates_dropped: u64,
    pub superseded: u64,
    pub ambiguous_conflicts: usize,
    pub error: Option<String>,
}

impl RevisionsResponse {
    pub fn from_report(report: &PassReport) -> Self {
        Self {
            success: true,
            accepted: report.feed.total_events,
            counts: report.totals,
            rejected: report
                .rejected
                .iter()
                .map(|r| RejectionJson {
                    ordinal: r.ordinal,
                    source: r.source.to_string(),
                    reason: r.reason.to_string(),
                })
                .collect(),
            failed_keys: report
                .failed_keys()
                .filter_map(|o| {
                    o.failure.as_ref().map(|f| FailureJson {
                        key: o.key.to_string(),
                        reason: f.reason.clone(),
                        skipped: f.skipped,
                    })
                })
                .collect(),
            duplicates_dropped: report.duplicates_dropped,
            superseded: report.superseded,
            ambiguous_conflicts: report.ambiguous_conflicts().count(),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            accepted: 0,
            counts: ApplyCounts::default(),
            rejected: vec![],
            failed_keys: vec![],
            duplicates_dropped: 0,
            superseded: 0,
            ambiguous_conflicts: 0,
            error: Some(msg.into()),
        }
    }
}

// =============================================================================
// EXPORT RESPONSE
// =============================================================================

/// Export response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub success: bool,
    pub data: Option<String>, // Base64 encoded TDMK dump
    pub slot_count: Option<usize>,
    pub error: Option<String>,
}

impl ExportResponse {
    pub fn success(data: &[u8], slot_count: usize) -> Self {
        Self {
            success: true,
            data: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                data,
            )),
            slot_count: Some(slot_count),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            slot_count: None,
            error: Some(msg.into()),
        }
    }
}
