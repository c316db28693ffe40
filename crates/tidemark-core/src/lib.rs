//! # tidemark-core
//!
//! The change-reconciliation engine for Tidemark - THE LOGIC.
//!
//! Turns revisions of entities, drawn from several source systems as full
//! snapshots or as insert/update/delete events, into two derived tables:
//! - a current-state table (SCD Type 1, latest value per key)
//! - a full-history table (SCD Type 2, validity intervals per value)
//!
//! ## Architectural Constraints
//!
//! The CORE:
//! - Has NO async, NO network dependencies (pure Rust)
//! - Never logs; every pass returns a structured report
//! - Never reads the environment; configuration is a value
//! - Only talks to storage through the store traits

// =============================================================================
// MODULES
// =============================================================================

pub mod audit;
pub mod config;
pub mod feed;
pub mod formats;
pub mod normalizer;
pub mod pipeline;
pub mod primitives;
pub mod reconciler;
pub mod reorder;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;
pub mod unifier;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    CurrentStateRow, FieldValue, HistoryVersion, Operation, Payload, RecordKey, Revision,
    Sequence, SourceTag, TidemarkError, Watermark,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use config::{ReconcileConfig, SourcePrecedence};
pub use feed::{FeedMetrics, FeedTracker, SourceFeed};
pub use normalizer::{NormalizeOutcome, Normalizer, RawRecord, RejectReason, RejectedRecord};
pub use pipeline::{PassMode, PassReport, Pipeline};
pub use reconciler::{Applied, ApplyCounts, KeyFailure, KeyOutcome, Reconciler};
pub use reorder::ReorderBuffer;
pub use unifier::{FieldConflict, Unifier, UnifyOutcome};

// =============================================================================
// RE-EXPORTS: Storage
// =============================================================================

pub use session::StorageBackend;
pub use storage::RedbStore;
pub use store::{
    ChangeStore, CurrentStateStore, HistoryStore, HistoryWrite, KeyChange, KeySlot, MemoryStore,
    RowWrite, SlotStore,
};

// =============================================================================
// RE-EXPORTS: Formats & Audit
// =============================================================================

pub use audit::{
    ActivityTier, AuditConfig, AuditProjector, AuditReport, ChangeCategory, KeyAudit,
    TierThresholds,
};
pub use formats::{TableDump, dump_from_bytes, dump_store, dump_to_bytes, restore_store};
