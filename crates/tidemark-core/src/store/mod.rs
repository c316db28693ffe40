//! # Output Stores
//!
//! The two derived tables of a key space and the interface the reconciler
//! writes them through.
//!
//! - [`CurrentStateStore`]: SCD Type 1, one row per key.
//! - [`HistoryStore`]: SCD Type 2, append-only versions per key.
//! - [`ChangeStore`]: both tables plus the per-key watermark, committed
//!   atomically per key.
//!
//! Backends only implement the small [`SlotStore`] primitive (read, or
//! atomically update, everything stored for one key); the public traits are
//! provided on top of it. Two backends exist: [`MemoryStore`] here and
//! [`crate::storage::RedbStore`] on disk.

mod memory;

pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};

use crate::types::{
    CurrentStateRow, HistoryVersion, Payload, RecordKey, Sequence, TidemarkError, Watermark,
};

// =============================================================================
// KEY SLOT
// =============================================================================

/// Everything stored for one key.
///
/// Invariants kept by every mutation:
/// - at most one open version, and it is the last one;
/// - versions are never removed, except an open version retracted at the
///   sequence it opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySlot {
    pub row: Option<CurrentStateRow>,
    pub versions: Vec<HistoryVersion>,
    pub watermark: Option<Watermark>,
}

impl KeySlot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row.is_none() && self.versions.is_empty() && self.watermark.is_none()
    }

    /// The current version, if the key has one.
    #[must_use]
    pub fn open_version(&self) -> Option<&HistoryVersion> {
        self.versions.last().filter(|v| v.is_current())
    }

    fn has_open_version(&self) -> bool {
        self.open_version().is_some()
    }

    fn open_version_mut(&mut self) -> Option<&mut HistoryVersion> {
        self.versions.last_mut().filter(|v| v.is_current())
    }

    /// Append a version, refusing a second open one.
    pub fn append(&mut self, key: &RecordKey, version: HistoryVersion) -> Result<(), TidemarkError> {
        if version.is_current() && self.has_open_version() {
            return Err(TidemarkError::OpenVersionExists(key.clone()));
        }
        self.versions.push(version);
        Ok(())
    }

    /// Close the open version at `at`.
    pub fn close_open(
        &mut self,
        key: &RecordKey,
        at: Sequence,
        deleted: bool,
    ) -> Result<(), TidemarkError> {
        let open = self
            .open_version_mut()
            .ok_or_else(|| TidemarkError::NoOpenVersion(key.clone()))?;
        open.valid_to = Some(at);
        open.deleted = deleted;
        Ok(())
    }

    /// Drop the open version opened at `at`. The version it superseded at
    /// `at`, if any, becomes the deleted one.
    pub fn retract_open(&mut self, key: &RecordKey, at: &Sequence) -> Result<(), TidemarkError> {
        if !self.open_version().is_some_and(|v| v.valid_from == *at) {
            return Err(TidemarkError::NoOpenVersion(key.clone()));
        }
        self.versions.pop();
        if let Some(previous) = self
            .versions
            .last_mut()
            .filter(|v| v.valid_to.as_ref() == Some(at))
        {
            previous.deleted = true;
        }
        Ok(())
    }

    /// Apply a reconciler decision.
    ///
    /// The change is validated first; on error the slot is left untouched.
    pub fn apply(&mut self, key: &RecordKey, change: KeyChange) -> Result<(), TidemarkError> {
        let has_open = self.has_open_version();
        match (&change.history, has_open) {
            (HistoryWrite::Open(_), true) => {
                return Err(TidemarkError::OpenVersionExists(key.clone()));
            }
            (
                HistoryWrite::Supersede { .. }
                | HistoryWrite::Refresh(_)
                | HistoryWrite::Close { .. }
                | HistoryWrite::Retract { .. },
                false,
            ) => return Err(TidemarkError::NoOpenVersion(key.clone())),
            _ => {}
        }

        match change.history {
            HistoryWrite::Keep => {}
            HistoryWrite::Open(version) => self.append(key, version)?,
            HistoryWrite::Supersede { at, next } => {
                self.close_open(key, at, false)?;
                self.append(key, next)?;
            }
            HistoryWrite::Refresh(payload) => {
                if let Some(open) = self.open_version_mut() {
                    open.payload = payload;
                }
            }
            HistoryWrite::Close { at, deleted } => self.close_open(key, at, deleted)?,
            HistoryWrite::Retract { at } => self.retract_open(key, &at)?,
        }

        match change.row {
            RowWrite::Keep => {}
            RowWrite::Put(row) => self.row = Some(row),
            RowWrite::Remove => self.row = None,
        }
        self.watermark = Some(change.watermark);
        Ok(())
    }
}

// =============================================================================
// KEY CHANGE
// =============================================================================

/// Write to the current-state row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowWrite {
    Keep,
    Put(CurrentStateRow),
    Remove,
}

/// Write to the history versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryWrite {
    Keep,
    /// Open the first version (or the first after a delete).
    Open(HistoryVersion),
    /// Close the open version at `at` and open `next`.
    Supersede { at: Sequence, next: HistoryVersion },
    /// Replace the open version's payload in place.
    Refresh(Payload),
    /// Close the open version.
    Close { at: Sequence, deleted: bool },
    /// Drop the open version opened at `at` (a delete winning its point).
    Retract { at: Sequence },
}

/// All writes one revision makes to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChange {
    pub row: RowWrite,
    pub history: HistoryWrite,
    pub watermark: Watermark,
}

impl KeyChange {
    /// A change that only advances the watermark.
    #[must_use]
    pub fn watermark_only(watermark: Watermark) -> Self {
        Self {
            row: RowWrite::Keep,
            history: HistoryWrite::Keep,
            watermark,
        }
    }
}

// =============================================================================
// BACKEND PRIMITIVE
// =============================================================================

/// Storage primitive every backend implements.
pub trait SlotStore: Send + Sync {
    /// Read everything stored for `key` (empty slot when unknown).
    fn read_slot(&self, key: &RecordKey) -> Result<KeySlot, TidemarkError>;

    /// Atomically read-modify-write the slot of `key`.
    ///
    /// When `f` fails nothing is persisted. `f` must not leave a partial
    /// mutation behind on error (every `KeySlot` method honours this).
    fn update_slot<R>(
        &self,
        key: &RecordKey,
        f: impl FnOnce(&mut KeySlot) -> Result<R, TidemarkError>,
    ) -> Result<R, TidemarkError>;

    /// Every key with stored history, sorted.
    fn slot_keys(&self) -> Result<Vec<RecordKey>, TidemarkError>;

    /// Every key with a current-state row, sorted.
    fn row_keys(&self) -> Result<Vec<RecordKey>, TidemarkError>;

    fn count_rows(&self) -> Result<usize, TidemarkError>;

    fn count_versions(&self) -> Result<usize, TidemarkError>;
}

// =============================================================================
// PUBLIC STORE TRAITS
// =============================================================================

/// SCD Type 1 table.
pub trait CurrentStateStore: Send + Sync {
    fn put(&self, key: &RecordKey, row: CurrentStateRow) -> Result<(), TidemarkError>;
    fn get(&self, key: &RecordKey) -> Result<Option<CurrentStateRow>, TidemarkError>;
    /// Remove a row. Returns whether one existed.
    fn delete(&self, key: &RecordKey) -> Result<bool, TidemarkError>;
    fn keys(&self) -> Result<Vec<RecordKey>, TidemarkError>;
    fn row_count(&self) -> Result<usize, TidemarkError>;
}

/// SCD Type 2 table.
pub trait HistoryStore: Send + Sync {
    /// Append a version. Refuses a second open version.
    fn append_version(&self, key: &RecordKey, version: HistoryVersion)
    -> Result<(), TidemarkError>;

    /// Close the open version at `at`.
    fn close_open_version(
        &self,
        key: &RecordKey,
        at: Sequence,
        deleted: bool,
    ) -> Result<(), TidemarkError>;

    /// Versions of a key ordered by `valid_from`.
    fn list_versions(&self, key: &RecordKey) -> Result<Vec<HistoryVersion>, TidemarkError>;

    fn history_keys(&self) -> Result<Vec<RecordKey>, TidemarkError>;

    fn version_count(&self) -> Result<usize, TidemarkError>;

    fn open_version(&self, key: &RecordKey) -> Result<Option<HistoryVersion>, TidemarkError> {
        Ok(self
            .list_versions(key)?
            .into_iter()
            .find(HistoryVersion::is_current))
    }

    /// The version valid at `at` (`valid_from <= at < valid_to`).
    fn version_at(
        &self,
        key: &RecordKey,
        at: &Sequence,
    ) -> Result<Option<HistoryVersion>, TidemarkError> {
        Ok(self
            .list_versions(key)?
            .into_iter()
            .rev()
            .find(|v| v.covers(at)))
    }
}

/// Both tables plus watermarks, committed atomically per key.
pub trait ChangeStore: CurrentStateStore + HistoryStore {
    fn watermark(&self, key: &RecordKey) -> Result<Option<Watermark>, TidemarkError>;

    /// Apply one key change atomically.
    fn commit(&self, key: &RecordKey, change: KeyChange) -> Result<(), TidemarkError>;

    /// Decide and commit in one atomic step.
    ///
    /// `decide` sees the key's stored state and returns the change to commit
    /// (if any) with a result for the caller.
    fn decide_and_commit<R>(
        &self,
        key: &RecordKey,
        decide: impl FnOnce(&KeySlot) -> Result<(Option<KeyChange>, R), TidemarkError>,
    ) -> Result<R, TidemarkError>;
}

impl<S: SlotStore> CurrentStateStore for S {
    fn put(&self, key: &RecordKey, row: CurrentStateRow) -> Result<(), TidemarkError> {
        self.update_slot(key, |slot| {
            slot.row = Some(row);
            Ok(())
        })
    }

    fn get(&self, key: &RecordKey) -> Result<Option<CurrentStateRow>, TidemarkError> {
        Ok(self.read_slot(key)?.row)
    }

    fn delete(&self, key: &RecordKey) -> Result<bool, TidemarkError> {
        self.update_slot(key, |slot| Ok(slot.row.take().is_some()))
    }

    fn keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        self.row_keys()
    }

    fn row_count(&self) -> Result<usize, TidemarkError> {
        self.count_rows()
    }
}

impl<S: SlotStore> HistoryStore for S {
    fn append_version(
        &self,
        key: &RecordKey,
        version: HistoryVersion,
    ) -> Result<(), TidemarkError> {
        self.update_slot(key, |slot| slot.append(key, version))
    }

    fn close_open_version(
        &self,
        key: &RecordKey,
        at: Sequence,
        deleted: bool,
    ) -> Result<(), TidemarkError> {
        self.update_slot(key, |slot| slot.close_open(key, at, deleted))
    }

    fn list_versions(&self, key: &RecordKey) -> Result<Vec<HistoryVersion>, TidemarkError> {
        Ok(self.read_slot(key)?.versions)
    }

    fn history_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        self.slot_keys()
    }

    fn version_count(&self) -> Result<usize, TidemarkError> {
        self.count_versions()
    }
}

impl<S: SlotStore> ChangeStore for S {
    fn watermark(&self, key: &RecordKey) -> Result<Option<Watermark>, TidemarkError> {
        Ok(self.read_slot(key)?.watermark)
    }

    fn commit(&self, key: &RecordKey, change: KeyChange) -> Result<(), TidemarkError> {
        self.update_slot(key, |slot| slot.apply(key, change))
    }

    fn decide_and_commit<R>(
        &self,
        key: &RecordKey,
        decide: impl FnOnce(&KeySlot) -> Result<(Option<KeyChange>, R), TidemarkError>,
    ) -> Result<R, TidemarkError> {
        self.update_slot(key, |slot| {
            let (change, outcome) = decide(slot)?;
            if let Some(change) = change {
                slot.apply(key, change)?;
            }
            Ok(outcome)
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
