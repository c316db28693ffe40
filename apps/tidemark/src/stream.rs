//! # Stream Driver
//!
//! Continuous reconciliation of an unbounded event feed.
//!
//! Keys are routed by hash to `shard_count` workers. Each worker runs on a
//! blocking thread, owns a [`ReorderBuffer`] and applies the revisions it
//! releases through the shared store; keys of one shard are applied
//! serially, shards run in parallel. Released revisions sharing a sequence
//! are merged field by field by the [`Unifier`] before they are applied,
//! exactly as in a batch pass. No lock is held across shards: the
//! store commits each key atomically.
//!
//! A key whose revision fails (unorderable sequence, store error) halts:
//! its pending revisions are dropped and later ones skipped. Other keys keep
//! flowing. [`StreamReconciler::finish`] closes the feed, drains every
//! buffer and returns a [`StreamSummary`].

use crate::reporting::log_field_conflict;
use std::collections::BTreeMap;
use std::sync::Arc;
use tidemark_core::{
    Applied, ApplyCounts, ChangeStore, ReconcileConfig, Reconciler, RecordKey, ReorderBuffer,
    Revision, TidemarkError, Unifier, primitives::shard_for,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Revisions queued per shard before `submit` waits.
const SHARD_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// SUMMARY
// =============================================================================

/// What a stream did, once finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub received: u64,
    pub counts: ApplyCounts,
    /// Halted keys and the error that halted them.
    pub halted: BTreeMap<RecordKey, String>,
    /// Revisions of halted keys that were never applied.
    pub skipped: u64,
    /// Identical revisions dropped while buffered or merged.
    pub duplicates_dropped: u64,
    /// Revisions folded into a same-sequence merge.
    pub superseded: u64,
    /// Fields the sources disagreed on within a same-sequence merge.
    pub conflicts: u64,
    /// Shards whose worker stopped before reporting.
    pub failed_shards: Vec<usize>,
}

impl StreamSummary {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.halted.is_empty() && self.failed_shards.is_empty()
    }

    fn merge(&mut self, shard: ShardSummary) {
        self.received = self.received.saturating_add(shard.received);
        self.counts.merge(&shard.counts);
        self.halted.extend(shard.halted);
        self.skipped = self.skipped.saturating_add(shard.skipped);
        self.duplicates_dropped = self
            .duplicates_dropped
            .saturating_add(shard.duplicates_dropped);
        self.superseded = self.superseded.saturating_add(shard.superseded);
        self.conflicts = self.conflicts.saturating_add(shard.conflicts);
    }
}

#[derive(Debug, Default)]
struct ShardSummary {
    received: u64,
    counts: ApplyCounts,
    halted: BTreeMap<RecordKey, String>,
    skipped: u64,
    duplicates_dropped: u64,
    superseded: u64,
    conflicts: u64,
}

// =============================================================================
// STREAM RECONCILER
// =============================================================================

pub struct StreamReconciler {
    senders: Vec<mpsc::Sender<Revision>>,
    workers: Vec<JoinHandle<ShardSummary>>,
}

impl StreamReconciler {
    /// Spawn one worker per shard over a shared store.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start<S>(store: Arc<S>, config: Arc<ReconcileConfig>) -> Self
    where
        S: ChangeStore + Send + Sync + 'static,
    {
        let shard_count = config.shard_count.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
            let store = Arc::clone(&store);
            let config = Arc::clone(&config);
            senders.push(tx);
            workers.push(tokio::task::spawn_blocking(move || {
                run_shard(shard, store.as_ref(), &config, rx)
            }));
        }

        tracing::info!(
            shards = shard_count,
            reorder_window = config.reorder_window,
            "Stream reconciler started"
        );
        Self { senders, workers }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    /// Route a revision to its key's shard.
    pub async fn submit(&self, revision: Revision) -> Result<(), TidemarkError> {
        let shard = shard_for(&revision.key, self.senders.len());
        let sender = self
            .senders
            .get(shard)
            .ok_or(TidemarkError::WorkerFailed(shard))?;
        sender
            .send(revision)
            .await
            .map_err(|_| TidemarkError::WorkerFailed(shard))
    }

    /// Close the feed, drain every buffer and collect the shard summaries.
    pub async fn finish(self) -> StreamSummary {
        drop(self.senders);

        let mut summary = StreamSummary::default();
        for (shard, worker) in self.workers.into_iter().enumerate() {
            match worker.await {
                Ok(shard_summary) => summary.merge(shard_summary),
                Err(e) => {
                    tracing::error!(shard, error = %e, "Shard worker failed");
                    summary.failed_shards.push(shard);
                }
            }
        }

        tracing::info!(
            received = summary.received,
            changed = summary.counts.changed(),
            stale = summary.counts.stale,
            halted = summary.halted.len(),
            "Stream finished"
        );
        summary
    }
}

// =============================================================================
// SHARD WORKER
// =============================================================================

fn run_shard<S: ChangeStore>(
    shard: usize,
    store: &S,
    config: &ReconcileConfig,
    mut rx: mpsc::Receiver<Revision>,
) -> ShardSummary {
    let worker = ShardWorker {
        shard,
        reconciler: Reconciler::new(store, config),
        unifier: Unifier::new(&config.precedence),
    };
    let mut buffer = ReorderBuffer::new(config.reorder_window, config.precedence.clone());
    let mut summary = ShardSummary::default();

    while let Some(revision) = rx.blocking_recv() {
        summary.received = summary.received.saturating_add(1);
        if summary.halted.contains_key(&revision.key) {
            summary.skipped = summary.skipped.saturating_add(1);
            continue;
        }
        let released = buffer.push(revision);
        worker.apply_released(&mut buffer, &mut summary, released);
    }

    let drained = buffer.drain();
    worker.apply_released(&mut buffer, &mut summary, drained);
    summary.duplicates_dropped = summary
        .duplicates_dropped
        .saturating_add(buffer.duplicates_dropped());
    summary
}

struct ShardWorker<'a, S: ChangeStore> {
    shard: usize,
    reconciler: Reconciler<'a, S>,
    unifier: Unifier<'a>,
}

impl<S: ChangeStore> ShardWorker<'_, S> {
    /// Merge same-sequence revisions, then apply each key's stream in order.
    fn apply_released(
        &self,
        buffer: &mut ReorderBuffer,
        summary: &mut ShardSummary,
        released: Vec<Revision>,
    ) {
        if released.is_empty() {
            return;
        }

        let unified = self.unifier.unify(released);
        summary.duplicates_dropped = summary
            .duplicates_dropped
            .saturating_add(unified.duplicates_dropped);
        summary.superseded = summary.superseded.saturating_add(unified.superseded);
        summary.conflicts = summary
            .conflicts
            .saturating_add(unified.conflicts.len() as u64);
        for conflict in &unified.conflicts {
            log_field_conflict(conflict);
        }

        for revision in unified.streams.values().flatten() {
            self.apply_one(buffer, summary, revision);
        }
    }

    fn apply_one(
        &self,
        buffer: &mut ReorderBuffer,
        summary: &mut ShardSummary,
        revision: &Revision,
    ) {
        if summary.halted.contains_key(&revision.key) {
            summary.skipped = summary.skipped.saturating_add(1);
            return;
        }

        match self.reconciler.apply(revision) {
            Ok(Applied::Stale) => {
                tracing::debug!(
                    key = %revision.key,
                    source = %revision.source,
                    sequence = %revision.sequence,
                    "Stale revision discarded"
                );
                summary.counts.record(Applied::Stale);
            }
            Ok(applied) => summary.counts.record(applied),
            Err(e) => {
                let dropped = buffer.flush_key(&revision.key).len() as u64;
                tracing::error!(
                    shard = self.shard,
                    key = %revision.key,
                    source = %revision.source,
                    sequence = %revision.sequence,
                    dropped,
                    error = %e,
                    "Key halted"
                );
                summary.skipped = summary.skipped.saturating_add(dropped);
                summary.halted.insert(revision.key.clone(), e.to_string());
            }
        }
    }
}
