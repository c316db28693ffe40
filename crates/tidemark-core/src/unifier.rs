//! # Multi-Source Unifier
//!
//! Merges revisions of the same key coming from several sources into one
//! stream per key, sorted ascending by sequence.
//!
//! ## Conflict Policy
//!
//! When sources disagree on a field, the winner is the candidate with the
//! greatest `(field precedence, sequence, default precedence, source name)`.
//! `Null` never beats a non-null value (coalesce). A disagreement that the
//! field precedence did not settle is reported as ambiguous.
//!
//! ## Modes
//!
//! - [`Unifier::unify`]: event batches. Same-sequence revisions from
//!   different sources merge into one; exact duplicates drop. A resent
//!   payload at a higher sequence is kept and left to the reconciler.
//! - [`Unifier::unify_snapshot`]: full snapshots. The latest revision per
//!   (key, source) is outer-joined into one upsert per key, and keys that
//!   vanished since the previous snapshot get a synthesized delete.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::SourcePrecedence;
use crate::types::{FieldValue, Operation, Payload, RecordKey, Revision, Sequence, SourceTag};

// =============================================================================
// OUTPUT TYPES
// =============================================================================

/// Sources disagreed on one field of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub key: RecordKey,
    pub field: String,
    pub sequence: Sequence,
    /// Non-null candidate values, by source.
    pub candidates: Vec<(SourceTag, FieldValue)>,
    pub winner: SourceTag,
    /// No configured field precedence separated the winner from a rival.
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnifyOutcome {
    pub streams: BTreeMap<RecordKey, Vec<Revision>>,
    /// Exact `(sequence, operation, payload)` duplicates removed.
    pub duplicates_dropped: u64,
    /// Revisions folded into a same-point merge or replaced by a later
    /// revision of the same source.
    pub superseded: u64,
    pub conflicts: Vec<FieldConflict>,
    pub synthesized_deletes: u64,
}

impl UnifyOutcome {
    /// Total revisions across all streams.
    #[must_use]
    pub fn revision_count(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }
}

struct Candidate<'r> {
    source: &'r SourceTag,
    sequence: &'r Sequence,
    value: &'r FieldValue,
}

// =============================================================================
// UNIFIER
// =============================================================================

pub struct Unifier<'a> {
    precedence: &'a SourcePrecedence,
}

impl<'a> Unifier<'a> {
    #[must_use]
    pub fn new(precedence: &'a SourcePrecedence) -> Self {
        Self { precedence }
    }

    /// Ordering used inside a key: sequence, then source precedence, then
    /// source name.
    #[must_use]
    pub fn revision_order(&self, a: &Revision, b: &Revision) -> Ordering {
        a.sequence
            .sort_cmp(&b.sequence)
            .then_with(|| self.precedence.rank(&a.source).cmp(&self.precedence.rank(&b.source)))
            .then_with(|| a.source.cmp(&b.source))
    }

    /// Unify an event batch.
    #[must_use]
    pub fn unify(&self, revisions: Vec<Revision>) -> UnifyOutcome {
        let mut outcome = UnifyOutcome::default();

        for (key, mut group) in group_by_key(revisions) {
            group.sort_by(|a, b| self.revision_order(a, b));

            let stream: Vec<Revision> = split_same_sequence(group)
                .into_iter()
                .filter_map(|point| self.merge_point(&key, point, &mut outcome))
                .collect();
            outcome.streams.insert(key, stream);
        }
        outcome
    }

    /// Unify one full snapshot.
    ///
    /// `previous_keys` is the current-state key set before this snapshot;
    /// keys in it that the snapshot no longer contains are deleted at
    /// `taken_at`.
    #[must_use]
    pub fn unify_snapshot(
        &self,
        revisions: Vec<Revision>,
        previous_keys: &[RecordKey],
        taken_at: &Sequence,
    ) -> UnifyOutcome {
        let mut outcome = UnifyOutcome::default();

        // Latest revision per (key, source).
        let mut latest: BTreeMap<RecordKey, BTreeMap<SourceTag, Revision>> = BTreeMap::new();
        for revision in revisions {
            let per_source = latest.entry(revision.key.clone()).or_default();
            match per_source.get(&revision.source) {
                Some(kept) if kept.sequence.sort_cmp(&revision.sequence) == Ordering::Greater => {
                    count_replaced(&revision, kept, &mut outcome);
                }
                Some(kept) => {
                    count_replaced(kept, &revision, &mut outcome);
                    per_source.insert(revision.source.clone(), revision);
                }
                None => {
                    per_source.insert(revision.source.clone(), revision);
                }
            }
        }

        for (key, per_source) in latest {
            let contributors: Vec<Revision> = per_source
                .into_values()
                .filter(|r| r.operation == Operation::Upsert)
                .collect();
            if let Some(merged) = self.join_sources(&key, &contributors, &mut outcome) {
                outcome.streams.insert(key, vec![merged]);
            }
        }

        for key in previous_keys {
            if !outcome.streams.contains_key(key) {
                outcome.streams.insert(
                    key.clone(),
                    vec![Revision::delete(
                        key.clone(),
                        taken_at.clone(),
                        SourceTag::snapshot_diff(),
                    )],
                );
                outcome.synthesized_deletes += 1;
            }
        }
        outcome
    }

    /// The most recent revision of every key in a batch.
    #[must_use]
    pub fn latest_per_key(&self, revisions: &[Revision]) -> BTreeMap<RecordKey, Revision> {
        let mut latest: BTreeMap<RecordKey, Revision> = BTreeMap::new();
        for revision in revisions {
            let newer = latest
                .get(&revision.key)
                .is_none_or(|kept| self.revision_order(revision, kept) == Ordering::Greater);
            if newer {
                latest.insert(revision.key.clone(), revision.clone());
            }
        }
        latest
    }

    /// Merge the revisions sharing one sequence into a single revision.
    fn merge_point(
        &self,
        key: &RecordKey,
        point: Vec<Revision>,
        outcome: &mut UnifyOutcome,
    ) -> Option<Revision> {
        // Highest precedence first; keep one representative per distinct change.
        let mut distinct: Vec<Revision> = Vec::with_capacity(point.len());
        for revision in point.into_iter().rev() {
            let seen = distinct
                .iter()
                .any(|d| d.operation == revision.operation && d.payload == revision.payload);
            if seen {
                outcome.duplicates_dropped += 1;
            } else {
                distinct.push(revision);
            }
        }

        let mut members = distinct.into_iter();
        let leader = members.next()?;
        let rest: Vec<Revision> = members.collect();
        if rest.is_empty() {
            return Some(leader);
        }

        match leader.operation {
            Operation::Delete => {
                outcome.superseded += rest.len() as u64;
                Some(leader)
            }
            Operation::Upsert => {
                let mut upserts = vec![leader];
                for revision in rest {
                    if revision.is_delete() {
                        outcome.superseded += 1;
                    } else {
                        upserts.push(revision);
                    }
                }
                outcome.superseded += upserts.len().saturating_sub(1) as u64;
                let payload = self.resolve_payload(key, &upserts, outcome);
                let mut merged = upserts.swap_remove(0);
                merged.payload = payload;
                Some(merged)
            }
        }
    }

    /// Outer-join the per-source revisions of one snapshot key.
    fn join_sources(
        &self,
        key: &RecordKey,
        contributors: &[Revision],
        outcome: &mut UnifyOutcome,
    ) -> Option<Revision> {
        let sequence = contributors
            .iter()
            .map(|r| &r.sequence)
            .max_by(|a, b| a.sort_cmp(b))?
            .clone();
        let source = contributors
            .iter()
            .map(|r| &r.source)
            .max_by(|a, b| {
                self.precedence
                    .rank(a)
                    .cmp(&self.precedence.rank(b))
                    .then_with(|| a.cmp(b))
            })?
            .clone();

        let payload = self.resolve_payload(key, contributors, outcome);
        Some(Revision::upsert(key.clone(), sequence, payload, source))
    }

    fn resolve_payload(
        &self,
        key: &RecordKey,
        members: &[Revision],
        outcome: &mut UnifyOutcome,
    ) -> Payload {
        let fields: BTreeSet<&String> = members
            .iter()
            .flat_map(|r| r.payload.iter().map(|(name, _)| name))
            .collect();

        fields
            .into_iter()
            .map(|field| {
                let candidates: Vec<Candidate<'_>> = members
                    .iter()
                    .filter_map(|r| {
                        r.payload.get(field).map(|value| Candidate {
                            source: &r.source,
                            sequence: &r.sequence,
                            value,
                        })
                    })
                    .collect();
                let value = self.resolve_field(key, field, &candidates, outcome);
                (field.clone(), value)
            })
            .collect()
    }

    fn resolve_field(
        &self,
        key: &RecordKey,
        field: &str,
        candidates: &[Candidate<'_>],
        outcome: &mut UnifyOutcome,
    ) -> FieldValue {
        let live: Vec<&Candidate<'_>> = candidates.iter().filter(|c| !c.value.is_null()).collect();
        let Some(first) = live.first() else {
            return FieldValue::Null;
        };
        if live.iter().all(|c| c.value == first.value) {
            return first.value.clone();
        }

        let Some(winner) = live
            .iter()
            .max_by(|a, b| self.candidate_order(field, a, b))
        else {
            return FieldValue::Null;
        };

        let winner_rank = self.precedence.field_rank(field, winner.source);
        let ambiguous = live.iter().any(|c| {
            c.value != winner.value && self.precedence.field_rank(field, c.source) == winner_rank
        });
        let sequence = live
            .iter()
            .map(|c| c.sequence)
            .max_by(|a, b| a.sort_cmp(b))
            .unwrap_or(winner.sequence)
            .clone();

        outcome.conflicts.push(FieldConflict {
            key: key.clone(),
            field: field.to_string(),
            sequence,
            candidates: live
                .iter()
                .map(|c| (c.source.clone(), c.value.clone()))
                .collect(),
            winner: winner.source.clone(),
            ambiguous,
        });
        winner.value.clone()
    }

    fn candidate_order(&self, field: &str, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let field_rank = |c: &Candidate<'_>| self.precedence.field_rank(field, c.source).unwrap_or(0);
        field_rank(a)
            .cmp(&field_rank(b))
            .then_with(|| a.sequence.sort_cmp(b.sequence))
            .then_with(|| self.precedence.rank(a.source).cmp(&self.precedence.rank(b.source)))
            .then_with(|| a.source.cmp(b.source))
    }
}

fn group_by_key(revisions: Vec<Revision>) -> BTreeMap<RecordKey, Vec<Revision>> {
    let mut groups: BTreeMap<RecordKey, Vec<Revision>> = BTreeMap::new();
    for revision in revisions {
        groups.entry(revision.key.clone()).or_default().push(revision);
    }
    groups
}

/// Split a sorted stream into runs sharing one sequence.
fn split_same_sequence(sorted: Vec<Revision>) -> Vec<Vec<Revision>> {
    let mut points: Vec<Vec<Revision>> = Vec::new();
    for revision in sorted {
        match points.last_mut() {
            Some(point)
                if point
                    .last()
                    .is_some_and(|r| r.sequence.sort_cmp(&revision.sequence) == Ordering::Equal) =>
            {
                point.push(revision);
            }
            _ => points.push(vec![revision]),
        }
    }
    points
}

/// Count a revision dropped in favour of `kept` from the same source.
fn count_replaced(dropped: &Revision, kept: &Revision, outcome: &mut UnifyOutcome) {
    let identical = dropped.sequence == kept.sequence
        && dropped.operation == kept.operation
        && dropped.payload == kept.payload;
    if identical {
        outcome.duplicates_dropped += 1;
    } else {
        outcome.superseded += 1;
    }
}

// =============================================================================
// TESTS
// =============================================================================
