//! # Pass Reporting
//!
//! The core never logs; every pass returns a [`PassReport`]. This module
//! turns a report into structured log events, one per noteworthy item.

use tidemark_core::{FieldConflict, PassReport};

/// Log one field conflict: a warning when no configured precedence settled
/// it, a debug line otherwise.
pub fn log_field_conflict(conflict: &FieldConflict) {
    if conflict.ambiguous {
        tracing::warn!(
            key = %conflict.key,
            field = %conflict.field,
            sequence = %conflict.sequence,
            winner = %conflict.winner,
            candidates = conflict.candidates.len(),
            "Ambiguous field conflict"
        );
    } else {
        tracing::debug!(
            key = %conflict.key,
            field = %conflict.field,
            sequence = %conflict.sequence,
            winner = %conflict.winner,
            "Field conflict settled by precedence"
        );
    }
}

/// Log the noteworthy parts of a pass: rejections, conflicts, halted keys,
/// then one summary line.
pub fn log_pass_report(report: &PassReport) {
    for rejected in &report.rejected {
        tracing::warn!(
            ordinal = rejected.ordinal,
            source = %rejected.source,
            reason = %rejected.reason,
            "Record rejected"
        );
    }

    for conflict in &report.conflicts {
        log_field_conflict(conflict);
    }

    for outcome in report.failed_keys() {
        if let Some(failure) = &outcome.failure {
            let (source, sequence) = failure
                .revision
                .as_ref()
                .map(|r| (r.source.to_string(), r.sequence.to_string()))
                .unwrap_or_default();
            tracing::error!(
                key = %outcome.key,
                source = %source,
                sequence = %sequence,
                skipped = failure.skipped,
                reason = %failure.reason,
                "Key halted"
            );
        }
    }

    tracing::info!(
        mode = ?report.mode,
        events = report.feed.total_events,
        keys = report.outcomes.len(),
        inserted = report.totals.inserted,
        updated = report.totals.updated,
        refreshed = report.totals.refreshed,
        deleted = report.totals.deleted,
        unchanged = report.totals.unchanged,
        stale = report.totals.stale,
        rejected = report.rejected.len(),
        synthesized_deletes = report.synthesized_deletes,
        "Pass complete"
    );
}
