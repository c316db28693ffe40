//! # Change Reconciler
//!
//! Decides, for each incoming revision, what happens to its key's
//! current-state row and history versions, and commits that decision
//! atomically through [`ChangeStore::decide_and_commit`].
//!
//! ## Decision Order
//!
//! 0. The sequence must be comparable with the key's watermark, otherwise
//!    the key halts with [`TidemarkError::UnorderableSequence`].
//! 1. Older than the watermark (or same point, not higher precedence) →
//!    [`Applied::Stale`], no write.
//! 2. Delete → close the open version, remove the row. A delete winning the
//!    point its open version started at retracts that version instead.
//! 3. Upsert → insert, update (new version), refresh (untracked change, in
//!    place) or no-op.
//!
//! The watermark advances on every non-stale revision, including no-ops and
//! deletes of absent keys, so redelivery stays idempotent.
//!
//! The reconciler is mode agnostic: snapshot and event passes both feed it
//! per-key streams in sequence order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::ReconcileConfig;
use crate::store::{ChangeStore, HistoryWrite, KeyChange, KeySlot, RowWrite};
use crate::types::{
    CurrentStateRow, HistoryVersion, Payload, RecordKey, Revision, TidemarkError, Watermark,
};

// =============================================================================
// OUTCOMES
// =============================================================================

/// What one revision did to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Applied {
    /// New row and first open version.
    Inserted,
    /// Tracked change: row overwritten, open version closed and a new one opened
    /// (or replaced in place at the same point).
    Updated,
    /// Untracked change: row and open version payload refreshed in place.
    Refreshed,
    /// Payload identical to the current row.
    Unchanged,
    /// Open version closed as deleted, row removed.
    Deleted,
    /// Delete of a key with no current row.
    Absent,
    /// Older than the key's watermark; discarded.
    Stale,
}

impl Applied {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Applied::Inserted => "inserted",
            Applied::Updated => "updated",
            Applied::Refreshed => "refreshed",
            Applied::Unchanged => "unchanged",
            Applied::Deleted => "deleted",
            Applied::Absent => "absent",
            Applied::Stale => "stale",
        }
    }
}

/// Tally of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounts {
    pub inserted: u64,
    pub updated: u64,
    pub refreshed: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub absent: u64,
    pub stale: u64,
}

impl ApplyCounts {
    pub fn record(&mut self, applied: Applied) {
        let slot = match applied {
            Applied::Inserted => &mut self.inserted,
            Applied::Updated => &mut self.updated,
            Applied::Refreshed => &mut self.refreshed,
            Applied::Unchanged => &mut self.unchanged,
            Applied::Deleted => &mut self.deleted,
            Applied::Absent => &mut self.absent,
            Applied::Stale => &mut self.stale,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn merge(&mut self, other: &ApplyCounts) {
        self.inserted = self.inserted.saturating_add(other.inserted);
        self.updated = self.updated.saturating_add(other.updated);
        self.refreshed = self.refreshed.saturating_add(other.refreshed);
        self.unchanged = self.unchanged.saturating_add(other.unchanged);
        self.deleted = self.deleted.saturating_add(other.deleted);
        self.absent = self.absent.saturating_add(other.absent);
        self.stale = self.stale.saturating_add(other.stale);
    }

    /// Revisions processed.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.changed()
            .saturating_add(self.unchanged)
            .saturating_add(self.absent)
            .saturating_add(self.stale)
    }

    /// Revisions that wrote a row or a version.
    #[must_use]
    pub fn changed(&self) -> u64 {
        self.inserted
            .saturating_add(self.updated)
            .saturating_add(self.refreshed)
            .saturating_add(self.deleted)
    }
}

/// Why a key's stream halted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub reason: String,
    /// The revision that failed, when one did.
    pub revision: Option<Revision>,
    /// Revisions of the stream left unapplied after the failure.
    pub skipped: usize,
}

/// Result of applying one key's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOutcome {
    pub key: RecordKey,
    pub counts: ApplyCounts,
    pub failure: Option<KeyFailure>,
}

impl KeyOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    /// Outcome for a key whose worker stopped before reporting.
    #[must_use]
    pub fn worker_failed(key: RecordKey, shard: usize, pending: usize) -> Self {
        Self {
            key,
            counts: ApplyCounts::default(),
            failure: Some(KeyFailure {
                reason: TidemarkError::WorkerFailed(shard).to_string(),
                revision: None,
                skipped: pending,
            }),
        }
    }
}

// =============================================================================
// RECONCILER
// =============================================================================

pub struct Reconciler<'a, S: ChangeStore> {
    store: &'a S,
    config: &'a ReconcileConfig,
}

impl<'a, S: ChangeStore> Reconciler<'a, S> {
    #[must_use]
    pub fn new(store: &'a S, config: &'a ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Apply one revision to its key.
    pub fn apply(&self, revision: &Revision) -> Result<Applied, TidemarkError> {
        let precedence = self.config.precedence.rank(&revision.source);
        self.store.decide_and_commit(&revision.key, |slot| {
            self.decide(slot, revision, precedence)
        })
    }

    /// Apply one key's stream in order. The stream halts at the first error.
    pub fn apply_stream(&self, key: &RecordKey, revisions: &[Revision]) -> KeyOutcome {
        let mut counts = ApplyCounts::default();
        for (idx, revision) in revisions.iter().enumerate() {
            match self.apply(revision) {
                Ok(applied) => counts.record(applied),
                Err(e) => {
                    return KeyOutcome {
                        key: key.clone(),
                        counts,
                        failure: Some(KeyFailure {
                            reason: e.to_string(),
                            revision: Some(revision.clone()),
                            skipped: revisions.len().saturating_sub(idx + 1),
                        }),
                    };
                }
            }
        }
        KeyOutcome {
            key: key.clone(),
            counts,
            failure: None,
        }
    }

    fn decide(
        &self,
        slot: &KeySlot,
        revision: &Revision,
        precedence: u32,
    ) -> Result<(Option<KeyChange>, Applied), TidemarkError> {
        let unorderable = || TidemarkError::UnorderableSequence {
            key: revision.key.clone(),
            revision: Box::new(revision.clone()),
            previous: slot.watermark.as_ref().map(|w| w.sequence.clone()),
        };

        if !revision.sequence.is_orderable() {
            return Err(unorderable());
        }

        let same_point = match &slot.watermark {
            None => false,
            Some(watermark) => match revision.sequence.try_cmp(&watermark.sequence) {
                None => return Err(unorderable()),
                Some(Ordering::Less) => return Ok((None, Applied::Stale)),
                Some(Ordering::Equal) if precedence <= watermark.precedence => {
                    return Ok((None, Applied::Stale));
                }
                Some(Ordering::Equal) => true,
                Some(Ordering::Greater) => false,
            },
        };

        let watermark = Watermark {
            sequence: revision.sequence.clone(),
            precedence,
        };

        if revision.is_delete() {
            return Ok(self.decide_delete(slot, revision, watermark, same_point));
        }
        Ok(self.decide_upsert(slot, revision, watermark, same_point))
    }

    fn decide_delete(
        &self,
        slot: &KeySlot,
        revision: &Revision,
        watermark: Watermark,
        same_point: bool,
    ) -> (Option<KeyChange>, Applied) {
        let history = match slot.open_version() {
            // Closing at the point it opened would leave `[s, s)`.
            Some(open) if same_point && open.valid_from == revision.sequence => {
                HistoryWrite::Retract {
                    at: revision.sequence.clone(),
                }
            }
            Some(_) => HistoryWrite::Close {
                at: revision.sequence.clone(),
                deleted: true,
            },
            None => HistoryWrite::Keep,
        };

        if slot.row.is_none() && history == HistoryWrite::Keep {
            return (Some(KeyChange::watermark_only(watermark)), Applied::Absent);
        }

        let change = KeyChange {
            row: if slot.row.is_some() {
                RowWrite::Remove
            } else {
                RowWrite::Keep
            },
            history,
            watermark,
        };
        (Some(change), Applied::Deleted)
    }

    fn decide_upsert(
        &self,
        slot: &KeySlot,
        revision: &Revision,
        watermark: Watermark,
        same_point: bool,
    ) -> (Option<KeyChange>, Applied) {
        let effective = match &slot.row {
            Some(row) if self.config.ignore_null_updates => {
                row.payload.overlay_non_null(&revision.payload)
            }
            _ => revision.payload.clone(),
        };

        let open = slot.open_version();
        let next_version =
            || HistoryVersion::open(revision.key.clone(), effective.clone(), revision.sequence.clone());
        let new_history = || match open {
            Some(_) => HistoryWrite::Supersede {
                at: revision.sequence.clone(),
                next: next_version(),
            },
            None => HistoryWrite::Open(next_version()),
        };

        let (history, applied) = match &slot.row {
            None => (new_history(), Applied::Inserted),
            Some(current) if current.payload == effective => {
                return (Some(KeyChange::watermark_only(watermark)), Applied::Unchanged);
            }
            Some(current) => {
                let tracked = self.tracked_change(&current.payload, &effective);
                let opened_here = open.is_some_and(|v| v.valid_from == revision.sequence);
                match (tracked, open) {
                    (false, Some(_)) => (HistoryWrite::Refresh(effective.clone()), Applied::Refreshed),
                    (true, Some(_)) if same_point && opened_here => {
                        (HistoryWrite::Refresh(effective.clone()), Applied::Updated)
                    }
                    _ => (new_history(), Applied::Updated),
                }
            }
        };

        let change = KeyChange {
            row: RowWrite::Put(CurrentStateRow {
                key: revision.key.clone(),
                payload: effective.clone(),
                sequence: revision.sequence.clone(),
            }),
            history,
            watermark,
        };
        (Some(change), applied)
    }

    /// Whether any tracked field differs between the two payloads.
    fn tracked_change(&self, before: &Payload, after: &Payload) -> bool {
        before
            .differing_fields(after)
            .into_iter()
            .any(|field| self.config.is_tracked(field))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CurrentStateStore, HistoryStore, MemoryStore};
    use crate::types::{FieldValue, Sequence, SourceTag};

    fn rev(seq: u64, email: &str) -> Revision {
        Revision::upsert(
            RecordKey::new("k"),
            Sequence::Counter(seq),
            Payload::new().with("email", FieldValue::text(email)),
            SourceTag::new("mongodb"),
        )
    }

    fn delete(seq: u64) -> Revision {
        Revision::delete(RecordKey::new("k"), Sequence::Counter(seq), SourceTag::new("mongodb"))
    }

    #[test]
    fn insert_update_delete_cycle() {
        let store = MemoryStore::new();
        let config = ReconcileConfig::default();
        let reconciler = Reconciler::new(&store, &config);
        let key = RecordKey::new("k");

        assert_eq!(reconciler.apply(&rev(1, "a")).expect("apply"), Applied::Inserted);
        assert_eq!(reconciler.apply(&rev(2, "b")).expect("apply"), Applied::Updated);
        assert_eq!(reconciler.apply(&rev(3, "b")).expect("apply"), Applied::Unchanged);
        assert_eq!(reconciler.apply(&delete(4)).expect("apply"), Applied::Deleted);
        assert_eq!(reconciler.apply(&delete(5)).expect("apply"), Applied::Absent);

        assert!(store.get(&key).expect("get").is_none());
        let versions = store.list_versions(&key).expect("versions");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].valid_to, Some(Sequence::Counter(4)));
        assert!(versions[1].deleted);
    }

    #[test]
    fn stale_revision_is_discarded() {
        let store = MemoryStore::new();
        let config = ReconcileConfig::default();
        let reconciler = Reconciler::new(&store, &config);

        reconciler.apply(&rev(5, "new")).expect("apply");
        assert_eq!(reconciler.apply(&rev(3, "old")).expect("apply"), Applied::Stale);
        assert_eq!(reconciler.apply(&rev(5, "new")).expect("apply"), Applied::Stale);

        let row = store.get(&RecordKey::new("k")).expect("get").expect("row");
        assert_eq!(row.payload.get("email"), Some(&FieldValue::text("new")));
    }

    #[test]
    fn redelivery_after_delete_stays_stale() {
        let store = MemoryStore::new();
        let config = ReconcileConfig::default();
        let reconciler = Reconciler::new(&store, &config);

        reconciler.apply(&rev(1, "a")).expect("apply");
        reconciler.apply(&delete(2)).expect("apply");
        assert_eq!(reconciler.apply(&rev(1, "a")).expect("apply"), Applied::Stale);
        assert!(store.get(&RecordKey::new("k")).expect("get").is_none());
    }

    #[test]
    fn untracked_change_refreshes_in_place() {
        let store = MemoryStore::new();
        let config = ReconcileConfig {
            tracked_fields: Some(vec!["email".to_string()]),
            ..ReconcileConfig::default()
        };
        let reconciler = Reconciler::new(&store, &config);
        let key = RecordKey::new("k");

        let first = rev(1, "a");
        let mut second = rev(2, "a");
        second.payload.insert("phone_number", FieldValue::text("555"));

        reconciler.apply(&first).expect("apply");
        assert_eq!(reconciler.apply(&second).expect("apply"), Applied::Refreshed);

        let versions = store.list_versions(&key).expect("versions");
        assert_eq!(versions.len(), 1);
        assert_eq!(
            versions[0].payload.get("phone_number"),
            Some(&FieldValue::text("555"))
        );
        let row = store.get(&key).expect("get").expect("row");
        assert_eq!(row.sequence, Sequence::Counter(2));
    }

    #[test]
    fn ignore_null_updates_keeps_existing_values() {
        let store = MemoryStore::new();
        let config = ReconcileConfig {
            ignore_null_updates: true,
            ..ReconcileConfig::default()
        };
        let reconciler = Reconciler::new(&store, &config);

        let mut first = rev(1, "a");
        first.payload.insert("city", FieldValue::text("Recife"));
        let mut partial = rev(2, "b");
        partial.payload.insert("city", FieldValue::Null);

        reconciler.apply(&first).expect("apply");
        reconciler.apply(&partial).expect("apply");
        let row = store.get(&RecordKey::new("k")).expect("get").expect("row");
        assert_eq!(row.payload.get("city"), Some(&FieldValue::text("Recife")));
        assert_eq!(row.payload.get("email"), Some(&FieldValue::text("b")));
    }

    #[test]
    fn unorderable_sequence_fails_without_writing() {
        let store = MemoryStore::new();
        let config = ReconcileConfig::default();
        let reconciler = Reconciler::new(&store, &config);

        reconciler.apply(&rev(1, "a")).expect("apply");
        let mut mixed = rev(2, "b");
        mixed.sequence = Sequence::Timestamp(2);
        let err = reconciler.apply(&mixed);
        assert!(matches!(err, Err(TidemarkError::UnorderableSequence { .. })));

        let mut unparsed = rev(2, "b");
        unparsed.sequence = Sequence::Unparsed("soon".to_string());
        assert!(reconciler.apply(&unparsed).is_err());

        let row = store.get(&RecordKey::new("k")).expect("get").expect("row");
        assert_eq!(row.sequence, Sequence::Counter(1));
    }

    #[test]
    fn stream_halts_on_first_error() {
        let store = MemoryStore::new();
        let config = ReconcileConfig::default();
        let reconciler = Reconciler::new(&store, &config);

        let mut bad = rev(2, "b");
        bad.sequence = Sequence::Unparsed("?".to_string());
        let outcome = reconciler.apply_stream(
            &RecordKey::new("k"),
            &[rev(1, "a"), bad, rev(3, "c"), rev(4, "d")],
        );
        assert!(!outcome.is_ok());
        assert_eq!(outcome.counts.inserted, 1);
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.skipped, 2);
        assert!(failure.revision.is_some());
    }

    #[test]
    fn same_point_delete_leaves_no_empty_version() {
        let store = MemoryStore::new();
        let config = ReconcileConfig::user_identity();
        let reconciler = Reconciler::new(&store, &config);
        let key = RecordKey::new("k");
        let mssql_delete =
            Revision::delete(key.clone(), Sequence::Counter(7), SourceTag::new("mssql"));

        reconciler.apply(&rev(3, "a")).expect("apply");
        reconciler.apply(&rev(7, "b")).expect("apply");
        assert_eq!(reconciler.apply(&mssql_delete).expect("apply"), Applied::Deleted);

        assert!(store.get(&key).expect("get").is_none());
        let versions = store.list_versions(&key).expect("versions");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].valid_from, Sequence::Counter(3));
        assert_eq!(versions[0].valid_to, Some(Sequence::Counter(7)));
        assert!(versions[0].deleted);
        assert!(versions.iter().all(|v| v.valid_to.as_ref() != Some(&v.valid_from)));
    }
}
