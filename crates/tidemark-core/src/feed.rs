//! # Change-Feed Metrics
//!
//! Per-pass observation of the incoming feed, before unification: how many
//! revisions each source sent, of which kind, over which sequence range,
//! and how many counter values are missing in between (lost events).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Operation, Revision, Sequence, SourceTag};

/// Feed figures for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFeed {
    pub events: u64,
    pub upserts: u64,
    pub deletes: u64,
    pub min_sequence: Option<Sequence>,
    pub max_sequence: Option<Sequence>,
    /// Counter values missing between the lowest and highest seen.
    pub counter_gaps: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetrics {
    pub by_source: BTreeMap<SourceTag, SourceFeed>,
    pub total_events: u64,
    pub upserts: u64,
    pub deletes: u64,
}

impl FeedMetrics {
    /// Measure a batch of normalized revisions.
    #[must_use]
    pub fn observe(revisions: &[Revision]) -> Self {
        let mut tracker = FeedTracker::default();
        for revision in revisions {
            tracker.record(revision);
        }
        tracker.finish()
    }

    /// Total missing counter values across sources.
    #[must_use]
    pub fn total_gaps(&self) -> u64 {
        self.by_source.values().map(|f| f.counter_gaps).sum()
    }
}

/// Incremental form of [`FeedMetrics::observe`], for feeds read one
/// revision at a time.
#[derive(Debug, Clone, Default)]
pub struct FeedTracker {
    metrics: FeedMetrics,
    counters: BTreeMap<SourceTag, BTreeSet<u64>>,
}

impl FeedTracker {
    pub fn record(&mut self, revision: &Revision) {
        let feed = self
            .metrics
            .by_source
            .entry(revision.source.clone())
            .or_default();
        feed.events += 1;
        match revision.operation {
            Operation::Upsert => feed.upserts += 1,
            Operation::Delete => feed.deletes += 1,
        }
        if revision.sequence.is_orderable() {
            widen(&mut feed.min_sequence, &revision.sequence, std::cmp::Ordering::Less);
            widen(&mut feed.max_sequence, &revision.sequence, std::cmp::Ordering::Greater);
        }
        if let Sequence::Counter(n) = revision.sequence {
            self.counters
                .entry(revision.source.clone())
                .or_default()
                .insert(n);
        }
        self.metrics.total_events += 1;
    }

    #[must_use]
    pub fn finish(self) -> FeedMetrics {
        let mut metrics = self.metrics;
        for (source, seen) in self.counters {
            if let Some(feed) = metrics.by_source.get_mut(&source) {
                feed.counter_gaps = count_gaps(&seen);
            }
        }
        metrics.upserts = metrics.by_source.values().map(|f| f.upserts).sum();
        metrics.deletes = metrics.by_source.values().map(|f| f.deletes).sum();
        metrics
    }
}

/// Replace `bound` with `candidate` when it lies further in `direction`.
///
/// Sequences of another kind than the current bound are ignored.
fn widen(bound: &mut Option<Sequence>, candidate: &Sequence, direction: std::cmp::Ordering) {
    let replace = match bound {
        None => true,
        Some(current) => candidate.try_cmp(current) == Some(direction),
    };
    if replace {
        *bound = Some(candidate.clone());
    }
}

fn count_gaps(seen: &BTreeSet<u64>) -> u64 {
    seen.iter()
        .zip(seen.iter().skip(1))
        .map(|(a, b)| b.saturating_sub(*a).saturating_sub(1))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Payload, RecordKey};

    fn rev(source: &str, seq: Sequence, delete: bool) -> Revision {
        let key = RecordKey::new("k");
        let source = SourceTag::new(source);
        if delete {
            Revision::delete(key, seq, source)
        } else {
            Revision::upsert(key, seq, Payload::new(), source)
        }
    }

    #[test]
    fn counts_by_source_and_operation() {
        let metrics = FeedMetrics::observe(&[
            rev("mongodb", Sequence::Counter(1), false),
            rev("mongodb", Sequence::Counter(2), true),
            rev("mssql", Sequence::Counter(7), false),
        ]);
        assert_eq!(metrics.total_events, 3);
        assert_eq!(metrics.upserts, 2);
        assert_eq!(metrics.deletes, 1);
        let mongo = &metrics.by_source[&SourceTag::new("mongodb")];
        assert_eq!(mongo.events, 2);
        assert_eq!(mongo.min_sequence, Some(Sequence::Counter(1)));
        assert_eq!(mongo.max_sequence, Some(Sequence::Counter(2)));
    }

    #[test]
    fn detects_counter_gaps_per_source() {
        let metrics = FeedMetrics::observe(&[
            rev("mongodb", Sequence::Counter(1), false),
            rev("mongodb", Sequence::Counter(4), false),
            rev("mongodb", Sequence::Counter(5), false),
            rev("mssql", Sequence::Counter(10), false),
            rev("mssql", Sequence::Counter(10), false),
        ]);
        assert_eq!(metrics.by_source[&SourceTag::new("mongodb")].counter_gaps, 2);
        assert_eq!(metrics.by_source[&SourceTag::new("mssql")].counter_gaps, 0);
        assert_eq!(metrics.total_gaps(), 2);
    }

    #[test]
    fn tracker_matches_batch_observation() {
        let revisions = [
            rev("mongodb", Sequence::Counter(1), false),
            rev("mongodb", Sequence::Counter(3), true),
            rev("mssql", Sequence::Timestamp(5), false),
        ];
        let mut tracker = FeedTracker::default();
        for revision in &revisions {
            tracker.record(revision);
        }
        assert_eq!(tracker.finish(), FeedMetrics::observe(&revisions));
    }

    #[test]
    fn timestamps_have_no_gaps() {
        let metrics = FeedMetrics::observe(&[
            rev("s", Sequence::Timestamp(100), false),
            rev("s", Sequence::Timestamp(900), false),
        ]);
        let feed = &metrics.by_source[&SourceTag::new("s")];
        assert_eq!(feed.counter_gaps, 0);
        assert_eq!(feed.max_sequence, Some(Sequence::Timestamp(900)));
    }
}
