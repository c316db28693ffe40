//! # Revision Normalizer
//!
//! Turns one raw record into exactly one [`Revision`] or one rejection.
//!
//! - Reads key, sequence and operation from the configured fields
//! - Strips pipeline metadata (`excluded_fields`)
//! - Projects the payload onto the unified schema when one is configured
//! - Enforces size limits on field names and text values
//!
//! Pure transform: no store access, no ordering decisions. An unreadable
//! sequence is kept as [`Sequence::Unparsed`] and fails later, per key, in
//! the reconciler.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ReconcileConfig;
use crate::primitives::{
    MAX_BATCH_LENGTH, MAX_FIELD_NAME_LENGTH, MAX_KEY_LENGTH, MAX_TEXT_VALUE_LENGTH,
};
use crate::types::{
    FieldValue, Operation, Payload, RecordKey, Revision, Sequence, SourceTag, TidemarkError,
};

// =============================================================================
// INPUT / OUTPUT TYPES
// =============================================================================

/// One record as parsed by the ingestion layer, tagged with its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: SourceTag,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: SourceTag::new(source),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insert.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    MissingKey,
    InvalidKey(String),
    MissingSequence,
    UnknownOperation(String),
    OversizedField(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingKey => f.write_str("missing key"),
            Self::InvalidKey(why) => write!(f, "invalid key: {why}"),
            Self::MissingSequence => f.write_str("missing sequence"),
            Self::UnknownOperation(op) => write!(f, "unknown operation {op:?}"),
            Self::OversizedField(name) => write!(f, "oversized field {name:?}"),
        }
    }
}

/// A rejected record, by position in its batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub ordinal: usize,
    pub source: SourceTag,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeOutcome {
    pub revisions: Vec<Revision>,
    pub rejected: Vec<RejectedRecord>,
}

// =============================================================================
// NORMALIZER
// =============================================================================

pub struct Normalizer<'a> {
    config: &'a ReconcileConfig,
    fallback_sequence: Option<Sequence>,
}

impl<'a> Normalizer<'a> {
    #[must_use]
    pub fn new(config: &'a ReconcileConfig) -> Self {
        Self {
            config,
            fallback_sequence: None,
        }
    }

    /// Sequence given to records that carry none (a snapshot's `taken_at`).
    #[must_use]
    pub fn with_fallback_sequence(mut self, sequence: Sequence) -> Self {
        self.fallback_sequence = Some(sequence);
        self
    }

    /// Normalize one record.
    pub fn normalize(&self, record: &RawRecord) -> Result<Revision, RejectReason> {
        check_sizes(record)?;

        let key = self.read_key(record)?;
        let sequence = self.read_sequence(record)?;
        let operation = self.read_operation(record)?;

        let payload = match operation {
            Operation::Delete => Payload::new(),
            Operation::Upsert => self.build_payload(record),
        };

        Ok(Revision {
            key,
            sequence,
            operation,
            payload,
            source: record.source.clone(),
        })
    }

    /// Normalize a batch. Rejections are collected, never dropped.
    pub fn normalize_batch(&self, records: &[RawRecord]) -> Result<NormalizeOutcome, TidemarkError> {
        if records.len() > MAX_BATCH_LENGTH {
            return Err(TidemarkError::BatchTooLarge {
                len: records.len(),
                max: MAX_BATCH_LENGTH,
            });
        }

        let mut outcome = NormalizeOutcome::default();
        for (ordinal, record) in records.iter().enumerate() {
            match self.normalize(record) {
                Ok(revision) => outcome.revisions.push(revision),
                Err(reason) => outcome.rejected.push(RejectedRecord {
                    ordinal,
                    source: record.source.clone(),
                    reason,
                }),
            }
        }
        Ok(outcome)
    }

    fn read_key(&self, record: &RawRecord) -> Result<RecordKey, RejectReason> {
        match record.fields.get(&self.config.key_field) {
            None | Some(FieldValue::Null) => Err(RejectReason::MissingKey),
            Some(FieldValue::Text(text)) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Err(RejectReason::MissingKey)
                } else if trimmed.len() > MAX_KEY_LENGTH {
                    Err(RejectReason::InvalidKey(format!(
                        "longer than {MAX_KEY_LENGTH} bytes"
                    )))
                } else {
                    Ok(RecordKey::new(trimmed))
                }
            }
            Some(FieldValue::Int(n)) if *n >= 0 => Ok(RecordKey::new(n.to_string())),
            Some(FieldValue::Int(n)) => Err(RejectReason::InvalidKey(format!("negative key {n}"))),
            Some(FieldValue::Bool(_)) => Err(RejectReason::InvalidKey("boolean key".to_string())),
        }
    }

    fn read_sequence(&self, record: &RawRecord) -> Result<Sequence, RejectReason> {
        match record.fields.get(&self.config.sequence_field) {
            None | Some(FieldValue::Null) => self
                .fallback_sequence
                .clone()
                .ok_or(RejectReason::MissingSequence),
            Some(FieldValue::Int(n)) => Ok(u64::try_from(*n)
                .map(Sequence::Counter)
                .unwrap_or_else(|_| Sequence::Unparsed(n.to_string()))),
            Some(FieldValue::Text(text)) => Ok(Sequence::parse(text)),
            Some(FieldValue::Bool(b)) => Ok(Sequence::Unparsed(b.to_string())),
        }
    }

    fn read_operation(&self, record: &RawRecord) -> Result<Operation, RejectReason> {
        match record.fields.get(&self.config.operation_field) {
            None | Some(FieldValue::Null) => Ok(Operation::Upsert),
            Some(FieldValue::Text(op)) => match op.trim().to_ascii_uppercase().as_str() {
                "INSERT" | "UPDATE" | "UPSERT" => Ok(Operation::Upsert),
                "DELETE" => Ok(Operation::Delete),
                _ => Err(RejectReason::UnknownOperation(op.clone())),
            },
            Some(other) => Err(RejectReason::UnknownOperation(other.to_string())),
        }
    }

    fn build_payload(&self, record: &RawRecord) -> Payload {
        let config = self.config;
        let is_role = |name: &str| {
            name == config.key_field || name == config.sequence_field || name == config.operation_field
        };

        match &config.schema_fields {
            Some(schema) => schema
                .iter()
                .filter(|name| !config.is_excluded(name))
                .map(|name| {
                    let value = record.fields.get(name).cloned().unwrap_or(FieldValue::Null);
                    (name.clone(), value)
                })
                .collect(),
            None => record
                .fields
                .iter()
                .filter(|(name, _)| !is_role(name) && !config.is_excluded(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

fn check_sizes(record: &RawRecord) -> Result<(), RejectReason> {
    for (name, value) in &record.fields {
        if name.len() > MAX_FIELD_NAME_LENGTH {
            return Err(RejectReason::OversizedField(
                name.chars().take(32).collect(),
            ));
        }
        if let FieldValue::Text(text) = value {
            if text.len() > MAX_TEXT_VALUE_LENGTH {
                return Err(RejectReason::OversizedField(name.clone()));
            }
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mongo(cpf: &str, seq: i64) -> RawRecord {
        RawRecord::new("mongodb")
            .field("cpf", FieldValue::text(cpf))
            .field("sequence", FieldValue::Int(seq))
            .field("email", FieldValue::text("a@x.com"))
            .field("ingestion_timestamp", FieldValue::text("2024-01-01 00:00:00"))
    }

    #[test]
    fn normalizes_upsert_and_strips_metadata() {
        let config = ReconcileConfig::user_identity();
        let normalizer = Normalizer::new(&config);
        let revision = normalizer.normalize(&mongo(" 111 ", 4)).expect("valid");

        assert_eq!(revision.key, RecordKey::new("111"));
        assert_eq!(revision.sequence, Sequence::Counter(4));
        assert_eq!(revision.operation, Operation::Upsert);
        assert_eq!(revision.payload.get("ingestion_timestamp"), None);
        // Schema projection fills the other source's fields with Null
        assert_eq!(revision.payload.get("job"), Some(&FieldValue::Null));
        assert_eq!(
            revision.payload.get("email"),
            Some(&FieldValue::text("a@x.com"))
        );
    }

    #[test]
    fn without_schema_keeps_all_but_role_fields() {
        let config = ReconcileConfig::default();
        let normalizer = Normalizer::new(&config);
        let revision = normalizer.normalize(&mongo("111", 1)).expect("valid");
        assert!(revision.payload.get("cpf").is_none());
        assert!(revision.payload.get("sequence").is_none());
        assert_eq!(revision.payload.len(), 2);
    }

    #[test]
    fn operation_is_case_insensitive() {
        let config = ReconcileConfig::default();
        let normalizer = Normalizer::new(&config);
        let record = mongo("111", 1).field("operation", FieldValue::text("delete"));
        let revision = normalizer.normalize(&record).expect("valid");
        assert!(revision.is_delete());
        assert!(revision.payload.is_empty());
    }

    #[test]
    fn rejections_carry_reason() {
        let config = ReconcileConfig::default();
        let normalizer = Normalizer::new(&config);

        let no_key = RawRecord::new("mssql").field("sequence", FieldValue::Int(1));
        assert_eq!(normalizer.normalize(&no_key), Err(RejectReason::MissingKey));

        let blank_key = mongo("   ", 1);
        assert_eq!(normalizer.normalize(&blank_key), Err(RejectReason::MissingKey));

        let bool_key = mongo("1", 1).field("cpf", FieldValue::Bool(true));
        assert!(matches!(
            normalizer.normalize(&bool_key),
            Err(RejectReason::InvalidKey(_))
        ));

        let no_seq = RawRecord::new("mssql").field("cpf", FieldValue::text("1"));
        assert_eq!(
            normalizer.normalize(&no_seq),
            Err(RejectReason::MissingSequence)
        );

        let bad_op = mongo("1", 1).field("operation", FieldValue::text("MERGE"));
        assert_eq!(
            normalizer.normalize(&bad_op),
            Err(RejectReason::UnknownOperation("MERGE".to_string()))
        );

        let huge = mongo("1", 1).field(
            "email",
            FieldValue::text("x".repeat(MAX_TEXT_VALUE_LENGTH + 1)),
        );
        assert_eq!(
            normalizer.normalize(&huge),
            Err(RejectReason::OversizedField("email".to_string()))
        );
    }

    #[test]
    fn fallback_sequence_fills_missing() {
        let config = ReconcileConfig::default();
        let normalizer = Normalizer::new(&config).with_fallback_sequence(Sequence::Counter(77));
        let record = RawRecord::new("mssql").field("cpf", FieldValue::text("1"));
        let revision = normalizer.normalize(&record).expect("valid");
        assert_eq!(revision.sequence, Sequence::Counter(77));
    }

    #[test]
    fn unreadable_sequence_is_kept_unparsed() {
        let config = ReconcileConfig::default();
        let normalizer = Normalizer::new(&config);
        let record = mongo("1", 1).field("sequence", FieldValue::text("last tuesday"));
        let revision = normalizer.normalize(&record).expect("not rejected");
        assert!(!revision.sequence.is_orderable());
    }

    #[test]
    fn batch_reports_rejections_by_ordinal() {
        let config = ReconcileConfig::default();
        let normalizer = Normalizer::new(&config);
        let records = vec![
            mongo("1", 1),
            RawRecord::new("mssql"),
            mongo("2", 2),
        ];
        let outcome = normalizer.normalize_batch(&records).expect("batch");
        assert_eq!(outcome.revisions.len(), 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].ordinal, 1);
        assert_eq!(outcome.rejected[0].source, SourceTag::new("mssql"));
    }
}
