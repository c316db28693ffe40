//! # Reorder Buffer
//!
//! Bounded per-key buffer that restores sequence order in an event stream.
//!
//! Each key holds up to `window` pending revisions ordered by
//! `(sequence, source precedence)`. When a push overflows the window, the
//! lowest pending revision is released, together with every pending revision
//! sharing its sequence, so a same-point group leaves the buffer whole and
//! can be merged. A revision arriving after a higher one was already
//! released still reaches the reconciler, which discards it as stale. A
//! window of `0` releases every revision immediately.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::SourcePrecedence;
use crate::types::{RecordKey, Revision};

#[derive(Debug)]
pub struct ReorderBuffer {
    window: usize,
    precedence: SourcePrecedence,
    pending: BTreeMap<RecordKey, Vec<Revision>>,
    duplicates_dropped: u64,
}

impl ReorderBuffer {
    #[must_use]
    pub fn new(window: usize, precedence: SourcePrecedence) -> Self {
        Self {
            window,
            precedence,
            pending: BTreeMap::new(),
            duplicates_dropped: 0,
        }
    }

    /// Buffer a revision; returns the revisions released, in apply order.
    pub fn push(&mut self, revision: Revision) -> Vec<Revision> {
        if self.window == 0 {
            return vec![revision];
        }

        let key = revision.key.clone();
        let queue = self.pending.entry(key.clone()).or_default();

        let duplicate = queue.iter().any(|held| {
            held.sequence == revision.sequence
                && held.operation == revision.operation
                && held.payload == revision.payload
        });
        if duplicate {
            self.duplicates_dropped = self.duplicates_dropped.saturating_add(1);
            return Vec::new();
        }

        let precedence = &self.precedence;
        let position = queue
            .iter()
            .position(|held| pending_order(precedence, &revision, held) == Ordering::Less)
            .unwrap_or(queue.len());
        queue.insert(position, revision);

        let mut released = Vec::new();
        while queue.len() > self.window {
            released.push(queue.remove(0));
        }
        if let Some(point) = released.last().map(|r| r.sequence.clone()) {
            while queue
                .first()
                .is_some_and(|held| held.sequence.sort_cmp(&point) == Ordering::Equal)
            {
                released.push(queue.remove(0));
            }
        }
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        released
    }

    /// Release everything pending for one key.
    pub fn flush_key(&mut self, key: &RecordKey) -> Vec<Revision> {
        self.pending.remove(key).unwrap_or_default()
    }

    /// Release everything pending, key by key.
    pub fn drain(&mut self) -> Vec<Revision> {
        std::mem::take(&mut self.pending)
            .into_values()
            .flatten()
            .collect()
    }

    /// Revisions currently held.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }
}

fn pending_order(precedence: &SourcePrecedence, a: &Revision, b: &Revision) -> Ordering {
    a.sequence
        .sort_cmp(&b.sequence)
        .then_with(|| precedence.rank(&a.source).cmp(&precedence.rank(&b.source)))
}
