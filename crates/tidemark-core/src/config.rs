//! # Reconciliation Configuration
//!
//! One static [`ReconcileConfig`] object drives a key space end to end:
//! which fields carry the key, sequence and operation, which fields are
//! metadata, which fields are tracked for history, how sources are ranked,
//! and how the audit projector groups changes.
//!
//! The core never reads the environment; the application deserializes this
//! from TOML and calls [`ReconcileConfig::validate`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::audit::{AuditConfig, ChangeCategory};
use crate::primitives::{
    DEFAULT_KEY_FIELD, DEFAULT_OPERATION_FIELD, DEFAULT_REORDER_WINDOW, DEFAULT_SEQUENCE_FIELD,
    DEFAULT_SHARD_COUNT, DEFAULT_SOURCE_FIELD, MAX_FIELD_NAME_LENGTH, MAX_SHARD_COUNT,
};
use crate::types::{SourceTag, TidemarkError};

// =============================================================================
// SOURCE PRECEDENCE
// =============================================================================

/// Ranking of source systems.
///
/// Earlier entries win. `fields` overrides `default_order` for individual
/// fields (e.g. profile fields prefer the HR system, delivery fields the
/// commerce system).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePrecedence {
    pub default_order: Vec<SourceTag>,
    pub fields: BTreeMap<String, Vec<SourceTag>>,
}

impl SourcePrecedence {
    /// Rank of a source in the default order. Higher wins; unknown sources rank 0.
    #[must_use]
    pub fn rank(&self, source: &SourceTag) -> u32 {
        rank_in(&self.default_order, source).unwrap_or(0)
    }

    /// Rank of a source for one field, if that field has its own order and
    /// lists the source.
    #[must_use]
    pub fn field_rank(&self, field: &str, source: &SourceTag) -> Option<u32> {
        self.fields
            .get(field)
            .and_then(|order| rank_in(order, source))
    }
}

fn rank_in(order: &[SourceTag], source: &SourceTag) -> Option<u32> {
    order
        .iter()
        .position(|s| s == source)
        .map(|idx| (order.len() - idx) as u32)
}

// =============================================================================
// RECONCILE CONFIG
// =============================================================================

/// Configuration of one key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub key_field: String,
    pub sequence_field: String,
    pub operation_field: String,
    /// Metadata stripped from every payload before reconciliation.
    pub excluded_fields: Vec<String>,
    /// Unified schema. When set, payloads are projected onto it and missing
    /// fields are filled with `Null`.
    pub schema_fields: Option<Vec<String>>,
    /// Fields whose change opens a new history version. `None` tracks all.
    pub tracked_fields: Option<Vec<String>>,
    /// Merge incoming non-null fields into the current payload instead of
    /// replacing it.
    pub ignore_null_updates: bool,
    pub reorder_window: usize,
    pub shard_count: usize,
    pub precedence: SourcePrecedence,
    pub audit: AuditConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            key_field: DEFAULT_KEY_FIELD.to_string(),
            sequence_field: DEFAULT_SEQUENCE_FIELD.to_string(),
            operation_field: DEFAULT_OPERATION_FIELD.to_string(),
            excluded_fields: vec![DEFAULT_SOURCE_FIELD.to_string()],
            schema_fields: None,
            tracked_fields: None,
            ignore_null_updates: false,
            reorder_window: DEFAULT_REORDER_WINDOW,
            shard_count: DEFAULT_SHARD_COUNT,
            precedence: SourcePrecedence::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl ReconcileConfig {
    /// The user-identity key space: profiles keyed by `cpf`, merged from a
    /// commerce source (`mongodb`) and an HR source (`mssql`).
    #[must_use]
    pub fn user_identity() -> Self {
        let mongodb = SourceTag::new("mongodb");
        let mssql = SourceTag::new("mssql");

        let mut fields = BTreeMap::new();
        for field in ["email", "delivery_address", "city"] {
            fields.insert(field.to_string(), vec![mongodb.clone(), mssql.clone()]);
        }
        for field in ["first_name", "last_name", "birthday", "job", "company_name"] {
            fields.insert(field.to_string(), vec![mssql.clone(), mongodb.clone()]);
        }

        let names = |list: &[&str]| list.iter().map(|s| (*s).to_string()).collect::<Vec<_>>();

        Self {
            excluded_fields: names(&[
                DEFAULT_SOURCE_FIELD,
                "ingestion_timestamp",
                "processed_timestamp",
                "dt_current_timestamp",
            ]),
            schema_fields: Some(names(&[
                "email",
                "delivery_address",
                "city",
                "first_name",
                "last_name",
                "birthday",
                "job",
                "company_name",
                "phone_number",
                "country",
            ])),
            tracked_fields: Some(names(&[
                "email",
                "delivery_address",
                "city",
                "first_name",
                "last_name",
                "job",
                "company_name",
            ])),
            precedence: SourcePrecedence {
                default_order: vec![mssql, mongodb],
                fields,
            },
            audit: AuditConfig {
                categories: vec![
                    ChangeCategory::new("email_changed", &["email"]),
                    ChangeCategory::new("address_changed", &["delivery_address", "city"]),
                    ChangeCategory::new("profile_changed", &["first_name", "last_name", "job"]),
                ],
                ..AuditConfig::default()
            },
            ..Self::default()
        }
    }

    /// Whether a change to `field` opens a new history version.
    #[must_use]
    pub fn is_tracked(&self, field: &str) -> bool {
        self.tracked_fields
            .as_ref()
            .is_none_or(|tracked| tracked.iter().any(|f| f == field))
    }

    #[must_use]
    pub fn is_excluded(&self, field: &str) -> bool {
        self.excluded_fields.iter().any(|f| f == field)
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), TidemarkError> {
        for (role, name) in [
            ("key_field", &self.key_field),
            ("sequence_field", &self.sequence_field),
            ("operation_field", &self.operation_field),
        ] {
            check_field_name(role, name)?;
            if self.is_excluded(name) {
                return Err(TidemarkError::InvalidConfig(format!(
                    "{role} '{name}' is also listed in excluded_fields"
                )));
            }
        }

        let roles: BTreeSet<&str> = [
            self.key_field.as_str(),
            self.sequence_field.as_str(),
            self.operation_field.as_str(),
        ]
        .into_iter()
        .collect();
        if roles.len() != 3 {
            return Err(TidemarkError::InvalidConfig(
                "key_field, sequence_field and operation_field must be distinct".to_string(),
            ));
        }

        if let Some(schema) = &self.schema_fields {
            let mut seen = BTreeSet::new();
            for name in schema {
                check_field_name("schema_fields", name)?;
                if !seen.insert(name.as_str()) {
                    return Err(TidemarkError::InvalidConfig(format!(
                        "schema field '{name}' listed twice"
                    )));
                }
                if roles.contains(name.as_str()) {
                    return Err(TidemarkError::InvalidConfig(format!(
                        "schema field '{name}' collides with a record role field"
                    )));
                }
            }
        }

        if let Some(tracked) = &self.tracked_fields {
            for name in tracked {
                check_field_name("tracked_fields", name)?;
            }
        }

        if self.shard_count == 0 || self.shard_count > MAX_SHARD_COUNT {
            return Err(TidemarkError::InvalidConfig(format!(
                "shard_count must be in 1..={MAX_SHARD_COUNT}, got {}",
                self.shard_count
            )));
        }

        self.audit.validate()
    }
}

fn check_field_name(role: &str, name: &str) -> Result<(), TidemarkError> {
    if name.trim().is_empty() {
        return Err(TidemarkError::InvalidConfig(format!(
            "{role} contains an empty field name"
        )));
    }
    if name.len() > MAX_FIELD_NAME_LENGTH {
        return Err(TidemarkError::InvalidConfig(format!(
            "{role} field name exceeds {MAX_FIELD_NAME_LENGTH} bytes"
        )));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
