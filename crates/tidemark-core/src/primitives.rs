//! # Engine Primitives
//!
//! Compiled-in constants for the Tidemark CORE: default field names, input
//! validation limits, concurrency defaults and the dump format header.
//!
//! Everything tunable per key space lives in [`crate::config::ReconcileConfig`];
//! the values here are its defaults and the hard limits it is validated against.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::types::RecordKey;

// =============================================================================
// DEFAULT FIELD NAMES
// =============================================================================

/// Business identifier of the user-identity key space.
pub const DEFAULT_KEY_FIELD: &str = "cpf";

/// Field carrying the ordering token.
pub const DEFAULT_SEQUENCE_FIELD: &str = "sequence";

/// Field carrying the change kind (`INSERT` / `UPDATE` / `DELETE`).
pub const DEFAULT_OPERATION_FIELD: &str = "operation";

/// Lineage field some feeds embed in the record itself.
pub const DEFAULT_SOURCE_FIELD: &str = "source_system";

/// Source tag of deletes inferred from a key missing in a later snapshot.
pub const SNAPSHOT_DIFF_SOURCE: &str = "snapshot-diff";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length, in bytes, of a record key.
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum length for field names.
///
/// Records with longer field names are rejected by the normalizer.
pub const MAX_FIELD_NAME_LENGTH: usize = 256;

/// Maximum length for text values (64KB).
///
/// This prevents memory exhaustion from malicious or malformed input.
pub const MAX_TEXT_VALUE_LENGTH: usize = 65536;

/// Maximum number of raw records in a single batch.
pub const MAX_BATCH_LENGTH: usize = 100_000;

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Pending revisions held per key before the lowest one is released.
pub const DEFAULT_REORDER_WINDOW: usize = 8;

/// Number of key shards reconciled in parallel.
pub const DEFAULT_SHARD_COUNT: usize = 8;

/// Upper bound accepted for `shard_count`.
pub const MAX_SHARD_COUNT: usize = 256;

// =============================================================================
// AUDIT DEFAULTS
// =============================================================================

/// Keys with at most this many transitions (and at least one) are `Low`.
pub const DEFAULT_LOW_ACTIVITY_MAX: u64 = 3;

/// Keys with at most this many transitions (above `Low`) are `Moderate`.
pub const DEFAULT_MODERATE_ACTIVITY_MAX: u64 = 10;

// =============================================================================
// DUMP FORMAT
// =============================================================================

/// Magic bytes for the Tidemark dump header.
///
/// - File Header = Magic Bytes ("TDMK") + Version (u8) before payload.
pub const MAGIC_BYTES: &[u8; 4] = b"TDMK";

/// Current serialization format version.
///
/// Increment this when making breaking changes to the serialization format.
pub const FORMAT_VERSION: u8 = 1;

/// Shard a key belongs to, in `0..shard_count`.
///
/// Stable for the lifetime of a process; used to route keys to workers and
/// store stripes, never persisted.
#[must_use]
pub fn shard_for(key: &RecordKey, shard_count: usize) -> usize {
    let shards = shard_count.max(1);
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    // Remainder of a u64 by a usize shard count always fits in usize.
    usize::try_from(hasher.finish() % shards as u64).unwrap_or(0)
}
