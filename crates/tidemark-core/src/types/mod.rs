//! # Core Type Definitions
//!
//! This module contains all core types for the Tidemark reconciliation engine:
//! - Identifiers (`RecordKey`, `SourceTag`)
//! - Record contents (`FieldValue`, `Payload`)
//! - Ordering tokens (`Sequence`, `Watermark`)
//! - The input unit (`Revision`) and the two output row shapes
//!   (`CurrentStateRow`, `HistoryVersion`)
//! - Error types (`TidemarkError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Keep field maps in `BTreeMap` so iteration and encoding order is stable
//! - Never compare sequences of different kinds (see [`Sequence::try_cmp`])

use chrono::{DateTime, NaiveDateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::primitives::SNAPSHOT_DIFF_SOURCE;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Business identifier of an entity. Stable across all of its revisions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(pub String);

impl RecordKey {
    /// Create a new key from a string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upstream system that produced a revision (lineage tag).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceTag(pub String);

impl SourceTag {
    /// Create a new source tag from a string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The tag carried by deletes the unifier infers from snapshot diffs.
    #[must_use]
    pub fn snapshot_diff() -> Self {
        Self::new(SNAPSHOT_DIFF_SOURCE)
    }

    /// Get the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// FIELD VALUES & PAYLOAD
// =============================================================================

/// Value of a single tracked attribute.
///
/// `Null` is an explicit value: a field present as `Null` is distinct from an
/// absent field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FieldValue {
    /// Build a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow the text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Field name → value mapping for all attributes of one revision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload(BTreeMap<String, FieldValue>);

impl Payload {
    /// Create an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.0.insert(field.into(), value)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Names of the fields whose value differs between the two payloads.
    ///
    /// A field absent on one side and present (even as `Null`) on the other
    /// counts as different.
    #[must_use]
    pub fn differing_fields<'a>(&'a self, other: &'a Payload) -> BTreeSet<&'a str> {
        self.0
            .keys()
            .chain(other.0.keys())
            .filter(|name| self.0.get(*name) != other.0.get(*name))
            .map(String::as_str)
            .collect()
    }

    /// Whether both payloads agree on every listed field.
    #[must_use]
    pub fn agrees_on(&self, other: &Payload, fields: &[String]) -> bool {
        fields
            .iter()
            .all(|name| self.0.get(name) == other.0.get(name))
    }

    /// Overlay the non-null fields of `incoming` on top of this payload.
    #[must_use]
    pub fn overlay_non_null(&self, incoming: &Payload) -> Payload {
        let mut merged = self.clone();
        for (name, value) in &incoming.0 {
            if !value.is_null() {
                merged.0.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

impl FromIterator<(String, FieldValue)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// SEQUENCE
// =============================================================================

/// Ordering token of a revision within its key.
///
/// Counters and timestamps are each totally ordered, but never against each
/// other. `Unparsed` keeps a value the normalizer could not interpret; it is
/// not comparable with anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sequence {
    /// Monotonic counter (e.g. a CDC `sequenceNum`).
    Counter(u64),
    /// Microseconds since the Unix epoch, UTC.
    Timestamp(i64),
    Unparsed(String),
}

impl Sequence {
    /// Interpret a textual ordering token.
    ///
    /// Accepts a decimal `u64`, an RFC 3339 datetime, or a naive
    /// `YYYY-MM-DD HH:MM:SS[.fff]` datetime read as UTC. Anything else is
    /// kept as `Unparsed`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(counter) = trimmed.parse::<u64>() {
            return Self::Counter(counter);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Self::Timestamp(dt.timestamp_micros());
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Self::Timestamp(naive.and_utc().timestamp_micros());
            }
        }
        Self::Unparsed(trimmed.to_string())
    }

    /// Compare two sequences of the same kind.
    ///
    /// Returns `None` when the pair cannot be ordered (different kinds, or
    /// either side `Unparsed`).
    #[must_use]
    pub fn try_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting mixed input before reconciliation.
    ///
    /// Same-kind sequences compare naturally; otherwise kinds are grouped.
    /// This never decides whether a revision may be applied.
    #[must_use]
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Unparsed(a), Self::Unparsed(b)) => a.cmp(b),
            _ => self
                .try_cmp(other)
                .unwrap_or_else(|| self.kind_rank().cmp(&other.kind_rank())),
        }
    }

    #[must_use]
    pub fn is_orderable(&self) -> bool {
        !matches!(self, Self::Unparsed(_))
    }

    /// Short name of the sequence kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Counter(_) => "counter",
            Self::Timestamp(_) => "timestamp",
            Self::Unparsed(_) => "unparsed",
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Counter(_) => 0,
            Self::Timestamp(_) => 1,
            Self::Unparsed(_) => 2,
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(n) => write!(f, "{n}"),
            Self::Timestamp(micros) => match DateTime::from_timestamp_micros(*micros) {
                Some(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => write!(f, "@{micros}us"),
            },
            Self::Unparsed(raw) => write!(f, "{raw:?}"),
        }
    }
}

/// Highest point applied to a key so far.
///
/// `precedence` is the rank of the source that produced the revision; it
/// breaks ties between revisions carrying the same sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub sequence: Sequence,
    pub precedence: u32,
}

// =============================================================================
// REVISION
// =============================================================================

/// Kind of change a revision carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operation {
    Upsert,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "UPSERT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed state of an entity at a point in time.
///
/// Built by the normalizer from one raw record, consumed once by the
/// reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub key: RecordKey,
    pub sequence: Sequence,
    pub operation: Operation,
    pub payload: Payload,
    /// Producing system. Never persisted in the output tables.
    pub source: SourceTag,
}

impl Revision {
    /// Create an upsert revision.
    #[must_use]
    pub fn upsert(key: RecordKey, sequence: Sequence, payload: Payload, source: SourceTag) -> Self {
        Self {
            key,
            sequence,
            operation: Operation::Upsert,
            payload,
            source,
        }
    }

    /// Create a delete revision (empty payload).
    #[must_use]
    pub fn delete(key: RecordKey, sequence: Sequence, source: SourceTag) -> Self {
        Self {
            key,
            sequence,
            operation: Operation::Delete,
            payload: Payload::new(),
            source,
        }
    }

    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}

// =============================================================================
// OUTPUT ROWS
// =============================================================================

/// SCD Type 1 row: the latest applied value of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentStateRow {
    pub key: RecordKey,
    pub payload: Payload,
    /// Sequence of the revision that last wrote this row.
    pub sequence: Sequence,
}

/// SCD Type 2 row: one validity interval `[valid_from, valid_to)` of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryVersion {
    pub key: RecordKey,
    pub payload: Payload,
    pub valid_from: Sequence,
    /// `None` while this is the current version.
    pub valid_to: Option<Sequence>,
    /// Set when a delete closed this version.
    pub deleted: bool,
}

impl HistoryVersion {
    /// Open a new current version.
    #[must_use]
    pub fn open(key: RecordKey, payload: Payload, valid_from: Sequence) -> Self {
        Self {
            key,
            payload,
            valid_from,
            valid_to: None,
            deleted: false,
        }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Whether `at` falls inside `[valid_from, valid_to)`.
    ///
    /// Unorderable comparisons count as outside.
    #[must_use]
    pub fn covers(&self, at: &Sequence) -> bool {
        let started = matches!(
            self.valid_from.try_cmp(at),
            Some(Ordering::Less | Ordering::Equal)
        );
        let not_ended = match &self.valid_to {
            None => true,
            Some(end) => matches!(at.try_cmp(end), Some(Ordering::Less)),
        };
        started && not_ended
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Tidemark engine.
///
/// - No silent failures
/// - Use `Result<T, TidemarkError>` for fallible operations
/// - Per-key errors are reported per key; they never abort a whole pass
#[derive(Debug, Error)]
pub enum TidemarkError {
    /// A revision's sequence cannot be ordered against what the key has seen.
    #[error("Unorderable {} sequence {} for key {key} (last applied: {})",
        .revision.sequence.kind(),
        .revision.sequence,
        .previous.as_ref().map_or_else(|| "none".to_string(), ToString::to_string))]
    UnorderableSequence {
        key: RecordKey,
        revision: Box<Revision>,
        previous: Option<Sequence>,
    },

    /// A second open history version was about to be created.
    #[error("Key {0} already has an open history version")]
    OpenVersionExists(RecordKey),

    /// A history write required an open version that does not exist.
    #[error("Key {0} has no open history version")]
    NoOpenVersion(RecordKey),

    /// The configuration object is inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An input batch exceeds the maximum accepted length.
    #[error("Batch of {len} records exceeds maximum {max}")]
    BatchTooLarge { len: usize, max: usize },

    /// A reconciliation worker stopped abnormally.
    #[error("Worker for shard {0} failed")]
    WorkerFailed(usize),

    /// A storage backend operation failed.
    #[error("Store error: {0}")]
    StoreError(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_parse_counter_and_timestamps() {
        assert_eq!(Sequence::parse("42"), Sequence::Counter(42));
        assert_eq!(
            Sequence::parse("1970-01-01T00:00:01Z"),
            Sequence::Timestamp(1_000_000)
        );
        assert_eq!(
            Sequence::parse("1970-01-01 00:00:02.5"),
            Sequence::Timestamp(2_500_000)
        );
        assert_eq!(
            Sequence::parse("yesterday"),
            Sequence::Unparsed("yesterday".to_string())
        );
    }

    #[test]
    fn sequence_kinds_do_not_compare() {
        let counter = Sequence::Counter(5);
        let stamp = Sequence::Timestamp(5);
        assert_eq!(counter.try_cmp(&stamp), None);
        assert_eq!(
            counter.try_cmp(&Sequence::Counter(7)),
            Some(Ordering::Less)
        );
        assert_eq!(Sequence::Unparsed("x".into()).try_cmp(&Sequence::Unparsed("x".into())), None);
    }

    #[test]
    fn sort_cmp_groups_kinds() {
        let mut seqs = vec![
            Sequence::Unparsed("b".into()),
            Sequence::Timestamp(1),
            Sequence::Counter(9),
            Sequence::Counter(2),
        ];
        seqs.sort_by(Sequence::sort_cmp);
        assert_eq!(
            seqs,
            vec![
                Sequence::Counter(2),
                Sequence::Counter(9),
                Sequence::Timestamp(1),
                Sequence::Unparsed("b".into()),
            ]
        );
    }

    #[test]
    fn timestamp_display_is_rfc3339() {
        assert_eq!(
            Sequence::Timestamp(1_000_000).to_string(),
            "1970-01-01T00:00:01Z"
        );
    }

    #[test]
    fn payload_differing_fields_sees_null_vs_absent() {
        let a = Payload::new().with("email", FieldValue::text("a@x.com"));
        let b = Payload::new()
            .with("email", FieldValue::text("a@x.com"))
            .with("city", FieldValue::Null);
        let diff: Vec<_> = a.differing_fields(&b).into_iter().collect();
        assert_eq!(diff, vec!["city"]);
    }

    #[test]
    fn overlay_keeps_existing_on_null() {
        let current = Payload::new()
            .with("email", FieldValue::text("a@x.com"))
            .with("job", FieldValue::text("chef"));
        let incoming = Payload::new()
            .with("email", FieldValue::Null)
            .with("job", FieldValue::text("pilot"));
        let merged = current.overlay_non_null(&incoming);
        assert_eq!(merged.get("email"), Some(&FieldValue::text("a@x.com")));
        assert_eq!(merged.get("job"), Some(&FieldValue::text("pilot")));
    }

    #[test]
    fn version_covers_half_open_interval() {
        let mut version = HistoryVersion::open(
            RecordKey::new("1"),
            Payload::new(),
            Sequence::Counter(10),
        );
        version.valid_to = Some(Sequence::Counter(20));
        assert!(!version.covers(&Sequence::Counter(9)));
        assert!(version.covers(&Sequence::Counter(10)));
        assert!(version.covers(&Sequence::Counter(19)));
        assert!(!version.covers(&Sequence::Counter(20)));
        assert!(!version.covers(&Sequence::Timestamp(15)));
    }

    #[test]
    fn unorderable_error_names_key_and_sequences() {
        let revision = Revision::upsert(
            RecordKey::new("k1"),
            Sequence::Timestamp(0),
            Payload::new(),
            SourceTag::new("mongodb"),
        );
        let err = TidemarkError::UnorderableSequence {
            key: RecordKey::new("k1"),
            revision: Box::new(revision),
            previous: Some(Sequence::Counter(3)),
        };
        let message = err.to_string();
        assert!(message.contains("k1"));
        assert!(message.contains("timestamp"));
        assert!(message.contains("last applied: 3"));
    }
}
