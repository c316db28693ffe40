//! # Audit Projection
//!
//! Read-only projection over the history table: how often each key changed,
//! what kind of change it was, and how active the key is.
//!
//! ## Activity Tiers
//!
//! | Tier | Transitions (defaults) |
//! |------|------------------------|
//! | NoChanges | 0 |
//! | Low | 1 – 3 |
//! | Moderate | 4 – 10 |
//! | High | > 10 |
//!
//! A transition is one adjacent pair of versions. Each transition is
//! classified into change categories by the fields that differ between the
//! two payloads; a category counts once per transition, and differing fields
//! that belong to no category count under [`OTHER_CATEGORY`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::primitives::{DEFAULT_LOW_ACTIVITY_MAX, DEFAULT_MODERATE_ACTIVITY_MAX};
use crate::store::HistoryStore;
use crate::types::{HistoryVersion, RecordKey, Sequence, TidemarkError};

/// Category counted for differing fields that no configured category claims.
pub const OTHER_CATEGORY: &str = "other";

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Upper bounds (inclusive) of the `Low` and `Moderate` tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    pub low_max: u64,
    pub moderate_max: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            low_max: DEFAULT_LOW_ACTIVITY_MAX,
            moderate_max: DEFAULT_MODERATE_ACTIVITY_MAX,
        }
    }
}

impl TierThresholds {
    /// Bucket a transition count.
    #[must_use]
    pub fn classify(&self, transitions: u64) -> ActivityTier {
        if transitions == 0 {
            ActivityTier::NoChanges
        } else if transitions <= self.low_max {
            ActivityTier::Low
        } else if transitions <= self.moderate_max {
            ActivityTier::Moderate
        } else {
            ActivityTier::High
        }
    }
}

/// A named group of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCategory {
    pub name: String,
    pub fields: Vec<String>,
}

impl ChangeCategory {
    #[must_use]
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub tiers: TierThresholds,
    pub categories: Vec<ChangeCategory>,
}

impl AuditConfig {
    pub fn validate(&self) -> Result<(), TidemarkError> {
        if self.tiers.low_max == 0 || self.tiers.low_max >= self.tiers.moderate_max {
            return Err(TidemarkError::InvalidConfig(format!(
                "audit tiers must satisfy 0 < low_max < moderate_max, got {} / {}",
                self.tiers.low_max, self.tiers.moderate_max
            )));
        }
        let mut names = std::collections::BTreeSet::new();
        for category in &self.categories {
            if category.name.trim().is_empty() || category.name == OTHER_CATEGORY {
                return Err(TidemarkError::InvalidConfig(format!(
                    "invalid audit category name '{}'",
                    category.name
                )));
            }
            if !names.insert(category.name.as_str()) {
                return Err(TidemarkError::InvalidConfig(format!(
                    "audit category '{}' defined twice",
                    category.name
                )));
            }
            if category.fields.is_empty() {
                return Err(TidemarkError::InvalidConfig(format!(
                    "audit category '{}' has no fields",
                    category.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// ACTIVITY TIER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActivityTier {
    NoChanges,
    Low,
    Moderate,
    High,
}

impl ActivityTier {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ActivityTier::NoChanges => "no_changes",
            ActivityTier::Low => "low",
            ActivityTier::Moderate => "moderate",
            ActivityTier::High => "high",
        }
    }
}

impl fmt::Display for ActivityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// REPORTS
// =============================================================================

/// Change summary of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAudit {
    pub key: RecordKey,
    pub versions: usize,
    pub transitions: u64,
    /// Versions closed by a delete.
    pub deletions: u64,
    /// Category name → number of transitions touching it.
    pub categories: BTreeMap<String, u64>,
    pub tier: ActivityTier,
    /// Whether the key currently has an open version.
    pub active: bool,
    pub first_seen: Option<Sequence>,
    pub last_change: Option<Sequence>,
}

/// Aggregate over every key in the history table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuditReport {
    pub keys: Vec<KeyAudit>,
    pub tier_counts: BTreeMap<ActivityTier, usize>,
    pub category_totals: BTreeMap<String, u64>,
    pub total_transitions: u64,
    pub total_deletions: u64,
}

impl AuditReport {
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of keys in a tier.
    #[must_use]
    pub fn tier_count(&self, tier: ActivityTier) -> usize {
        self.tier_counts.get(&tier).copied().unwrap_or(0)
    }
}

// =============================================================================
// PROJECTOR
// =============================================================================

/// Audit Projector - pure read-side view of the history table.
pub struct AuditProjector<'a> {
    config: &'a AuditConfig,
}

impl<'a> AuditProjector<'a> {
    #[must_use]
    pub fn new(config: &'a AuditConfig) -> Self {
        Self { config }
    }

    /// Summarize one key from its versions (ordered by `valid_from`).
    #[must_use]
    pub fn project_versions(&self, key: &RecordKey, versions: &[HistoryVersion]) -> KeyAudit {
        let mut categories: BTreeMap<String, u64> = BTreeMap::new();
        let transitions = versions.len().saturating_sub(1) as u64;

        for pair in versions.windows(2) {
            let [before, after] = pair else { continue };
            for category in self.classify(before, after) {
                *categories.entry(category).or_insert(0) += 1;
            }
        }

        let deletions = versions.iter().filter(|v| v.deleted).count() as u64;
        let last_change = versions.last().map(|v| match (&v.valid_to, v.deleted) {
            (Some(closed), true) => closed.clone(),
            _ => v.valid_from.clone(),
        });

        KeyAudit {
            key: key.clone(),
            versions: versions.len(),
            transitions,
            deletions,
            categories,
            tier: self.config.tiers.classify(transitions),
            active: versions.last().is_some_and(HistoryVersion::is_current),
            first_seen: versions.first().map(|v| v.valid_from.clone()),
            last_change,
        }
    }

    /// Summarize one key read from a history store.
    pub fn project_key<H: HistoryStore + ?Sized>(
        &self,
        store: &H,
        key: &RecordKey,
    ) -> Result<KeyAudit, TidemarkError> {
        let versions = store.list_versions(key)?;
        Ok(self.project_versions(key, &versions))
    }

    /// Summarize every key of a history store.
    pub fn project<H: HistoryStore + ?Sized>(
        &self,
        store: &H,
    ) -> Result<AuditReport, TidemarkError> {
        let mut report = AuditReport::default();
        for key in store.history_keys()? {
            let audit = self.project_key(store, &key)?;
            *report.tier_counts.entry(audit.tier).or_insert(0) += 1;
            for (name, count) in &audit.categories {
                *report.category_totals.entry(name.clone()).or_insert(0) += count;
            }
            report.total_transitions = report.total_transitions.saturating_add(audit.transitions);
            report.total_deletions = report.total_deletions.saturating_add(audit.deletions);
            report.keys.push(audit);
        }
        Ok(report)
    }

    /// Categories touched by the transition `before → after`.
    fn classify(&self, before: &HistoryVersion, after: &HistoryVersion) -> Vec<String> {
        let differing = before.payload.differing_fields(&after.payload);
        let mut touched: Vec<String> = Vec::new();

        for category in &self.config.categories {
            if category
                .fields
                .iter()
                .any(|f| differing.contains(f.as_str()))
            {
                touched.push(category.name.clone());
            }
        }

        let unclaimed = differing.iter().any(|field| {
            !self
                .config
                .categories
                .iter()
                .any(|c| c.fields.iter().any(|f| f.as_str() == *field))
        });
        if unclaimed {
            touched.push(OTHER_CATEGORY.to_string());
        }
        touched
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::types::{FieldValue, Payload};

    fn version(from: u64, to: Option<u64>, email: &str, city: &str) -> HistoryVersion {
        HistoryVersion {
            key: RecordKey::new("k"),
            payload: Payload::new()
                .with("email", FieldValue::text(email))
                .with("city", FieldValue::text(city)),
            valid_from: Sequence::Counter(from),
            valid_to: to.map(Sequence::Counter),
            deleted: false,
        }
    }

    #[test]
    fn tiers_use_inclusive_bounds() {
        let tiers = TierThresholds::default();
        assert_eq!(tiers.classify(0), ActivityTier::NoChanges);
        assert_eq!(tiers.classify(1), ActivityTier::Low);
        assert_eq!(tiers.classify(3), ActivityTier::Low);
        assert_eq!(tiers.classify(4), ActivityTier::Moderate);
        assert_eq!(tiers.classify(10), ActivityTier::Moderate);
        assert_eq!(tiers.classify(11), ActivityTier::High);
    }

    #[test]
    fn single_version_reports_no_changes() {
        let config = ReconcileConfig::user_identity();
        let projector = AuditProjector::new(&config.audit);
        let audit = projector.project_versions(
            &RecordKey::new("k"),
            &[version(1, None, "a@x.com", "Recife")],
        );
        assert_eq!(audit.transitions, 0);
        assert_eq!(audit.tier, ActivityTier::NoChanges);
        assert!(audit.categories.is_empty());
        assert!(audit.active);
    }

    #[test]
    fn category_counts_once_per_transition() {
        let config = ReconcileConfig::user_identity();
        let projector = AuditProjector::new(&config.audit);
        let versions = vec![
            version(1, Some(2), "a@x.com", "Recife"),
            version(2, Some(3), "b@x.com", "Recife"),
            version(3, None, "c@x.com", "Natal"),
        ];
        let audit = projector.project_versions(&RecordKey::new("k"), &versions);
        assert_eq!(audit.transitions, 2);
        assert_eq!(audit.categories.get("email_changed"), Some(&2));
        assert_eq!(audit.categories.get("address_changed"), Some(&1));
        assert_eq!(audit.tier, ActivityTier::Low);
        assert_eq!(audit.last_change, Some(Sequence::Counter(3)));
    }

    #[test]
    fn unclaimed_fields_count_as_other() {
        let audit_config = AuditConfig {
            categories: vec![ChangeCategory::new("email_changed", &["email"])],
            ..AuditConfig::default()
        };
        let projector = AuditProjector::new(&audit_config);
        let versions = vec![
            version(1, Some(2), "a@x.com", "Recife"),
            version(2, None, "a@x.com", "Natal"),
        ];
        let audit = projector.project_versions(&RecordKey::new("k"), &versions);
        assert_eq!(audit.categories.get(OTHER_CATEGORY), Some(&1));
        assert_eq!(audit.categories.get("email_changed"), None);
    }

    #[test]
    fn deleted_versions_are_counted() {
        let projector_config = AuditConfig::default();
        let projector = AuditProjector::new(&projector_config);
        let mut closed = version(1, Some(5), "a@x.com", "Recife");
        closed.deleted = true;
        let audit = projector.project_versions(&RecordKey::new("k"), &[closed]);
        assert_eq!(audit.deletions, 1);
        assert!(!audit.active);
        assert_eq!(audit.last_change, Some(Sequence::Counter(5)));
    }

    #[test]
    fn invalid_tiers_rejected() {
        let config = AuditConfig {
            tiers: TierThresholds {
                low_max: 5,
                moderate_max: 5,
            },
            categories: Vec::new(),
        };
        assert!(config.validate().is_err());
    }
}
