//! # Reconciliation Pipeline
//!
//! Explicit wiring of one key space:
//!
//! ```text
//! raw records → Normalizer → Unifier → Reconciler → {current, history} → AuditProjector
//! ```
//!
//! Two batch entry points share one reconciler:
//! - [`Pipeline::run_snapshot`]: full recomputation from a snapshot
//! - [`Pipeline::run_events`]: an incremental event batch
//!
//! Keys are partitioned into `shard_count` shards; each non-empty shard is
//! reconciled on its own scoped thread, keys within a shard serially. A pass
//! always finishes for every key and reports per-key failures in the
//! [`PassReport`]; a panicking worker fails only its shard's keys.

use std::collections::BTreeMap;

use crate::audit::{AuditProjector, AuditReport};
use crate::config::ReconcileConfig;
use crate::feed::FeedMetrics;
use crate::normalizer::{Normalizer, RawRecord, RejectedRecord};
use crate::primitives::shard_for;
use crate::reconciler::{ApplyCounts, KeyOutcome, Reconciler};
use crate::store::ChangeStore;
use crate::types::{RecordKey, Revision, Sequence, TidemarkError};
use crate::unifier::{FieldConflict, Unifier, UnifyOutcome};

/// Which batch entry point produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassMode {
    Snapshot,
    Events,
}

/// Everything one pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub mode: PassMode,
    pub rejected: Vec<RejectedRecord>,
    pub duplicates_dropped: u64,
    pub superseded: u64,
    pub synthesized_deletes: u64,
    pub conflicts: Vec<FieldConflict>,
    pub feed: FeedMetrics,
    /// One entry per key, sorted by key.
    pub outcomes: Vec<KeyOutcome>,
    pub totals: ApplyCounts,
}

impl PassReport {
    /// Keys whose stream halted.
    pub fn failed_keys(&self) -> impl Iterator<Item = &KeyOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }

    /// No rejection and no key failure.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.outcomes.iter().all(KeyOutcome::is_ok)
    }

    /// Conflicts no configured precedence settled.
    pub fn ambiguous_conflicts(&self) -> impl Iterator<Item = &FieldConflict> {
        self.conflicts.iter().filter(|c| c.ambiguous)
    }
}

pub struct Pipeline<S: ChangeStore> {
    config: ReconcileConfig,
    store: S,
}

impl<S: ChangeStore> Pipeline<S> {
    /// Build a pipeline over a store. The configuration is validated here.
    pub fn new(config: ReconcileConfig, store: S) -> Result<Self, TidemarkError> {
        config.validate()?;
        Ok(Self { config, store })
    }

    #[must_use]
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Reconcile a full snapshot taken at `taken_at`.
    ///
    /// Records without a sequence are stamped with `taken_at`; keys present
    /// before but missing from the snapshot are deleted at `taken_at`.
    pub fn run_snapshot(
        &self,
        records: &[RawRecord],
        taken_at: Sequence,
    ) -> Result<PassReport, TidemarkError> {
        let normalized = Normalizer::new(&self.config)
            .with_fallback_sequence(taken_at.clone())
            .normalize_batch(records)?;
        let feed = FeedMetrics::observe(&normalized.revisions);

        let previous_keys = self.store.keys()?;
        let unified = Unifier::new(&self.config.precedence).unify_snapshot(
            normalized.revisions,
            &previous_keys,
            &taken_at,
        );
        Ok(self.finish(PassMode::Snapshot, normalized.rejected, feed, unified))
    }

    /// Reconcile an incremental event batch.
    pub fn run_events(&self, records: &[RawRecord]) -> Result<PassReport, TidemarkError> {
        let normalized = Normalizer::new(&self.config).normalize_batch(records)?;
        let feed = FeedMetrics::observe(&normalized.revisions);
        let unified = Unifier::new(&self.config.precedence).unify(normalized.revisions);
        Ok(self.finish(PassMode::Events, normalized.rejected, feed, unified))
    }

    /// Apply per-key streams, shards in parallel.
    pub fn reconcile_streams(&self, streams: BTreeMap<RecordKey, Vec<Revision>>) -> Vec<KeyOutcome> {
        let shard_count = self.config.shard_count.max(1);
        let mut shards: Vec<Vec<(RecordKey, Vec<Revision>)>> =
            (0..shard_count).map(|_| Vec::new()).collect();
        for (key, stream) in streams {
            let idx = shard_for(&key, shard_count);
            if let Some(shard) = shards.get_mut(idx) {
                shard.push((key, stream));
            }
        }

        let reconciler = Reconciler::new(&self.store, &self.config);
        let mut outcomes: Vec<KeyOutcome> = std::thread::scope(|scope| {
            let workers: Vec<_> = shards
                .into_iter()
                .enumerate()
                .filter(|(_, shard)| !shard.is_empty())
                .map(|(idx, shard)| {
                    let pending: Vec<(RecordKey, usize)> = shard
                        .iter()
                        .map(|(key, stream)| (key.clone(), stream.len()))
                        .collect();
                    let reconciler = &reconciler;
                    let handle = scope.spawn(move || {
                        shard
                            .iter()
                            .map(|(key, stream)| reconciler.apply_stream(key, stream))
                            .collect::<Vec<_>>()
                    });
                    (idx, pending, handle)
                })
                .collect();

            let mut outcomes = Vec::new();
            for (idx, pending, handle) in workers {
                match handle.join() {
                    Ok(shard_outcomes) => outcomes.extend(shard_outcomes),
                    Err(_) => outcomes.extend(
                        pending
                            .into_iter()
                            .map(|(key, len)| KeyOutcome::worker_failed(key, idx, len)),
                    ),
                }
            }
            outcomes
        });

        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        outcomes
    }

    /// Project the history table.
    pub fn audit(&self) -> Result<AuditReport, TidemarkError> {
        AuditProjector::new(&self.config.audit).project(&self.store)
    }

    fn finish(
        &self,
        mode: PassMode,
        rejected: Vec<RejectedRecord>,
        feed: FeedMetrics,
        unified: UnifyOutcome,
    ) -> PassReport {
        let outcomes = self.reconcile_streams(unified.streams);
        let mut totals = ApplyCounts::default();
        for outcome in &outcomes {
            totals.merge(&outcome.counts);
        }

        PassReport {
            mode,
            rejected,
            duplicates_dropped: unified.duplicates_dropped,
            superseded: unified.superseded,
            synthesized_deletes: unified.synthesized_deletes,
            conflicts: unified.conflicts,
            feed,
            outcomes,
            totals,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
