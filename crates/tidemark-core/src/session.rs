//! # Storage Backends
//!
//! A key space is held either in memory or on disk:
//! - `InMemory`: [`MemoryStore`] (fast, volatile unless explicitly dumped)
//! - `Persistent`: [`RedbStore`] (ACID, every commit durable)
//!
//! `StorageBackend` implements the store primitive by delegation, so the
//! reconciler, pipeline and projector work the same on either.

use std::path::Path;

use crate::formats::{TableDump, restore_store};
use crate::storage::RedbStore;
use crate::store::{KeySlot, MemoryStore, SlotStore};
use crate::types::{RecordKey, TidemarkError};

#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory store (fast, volatile).
    InMemory(MemoryStore),
    /// Disk-backed store using redb (ACID, persistent).
    Persistent(RedbStore),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(MemoryStore::new())
    }
}

// NOTE: StorageBackend does NOT implement Clone; a redb handle cannot be
// duplicated. Copy data between backends through a TableDump.

impl StorageBackend {
    /// Open or create a redb-backed store at the given path.
    pub fn with_redb(path: impl AsRef<Path>) -> Result<Self, TidemarkError> {
        Ok(Self::Persistent(RedbStore::open(path)?))
    }

    /// Build an in-memory store holding a dump.
    pub fn from_dump(dump: TableDump) -> Result<Self, TidemarkError> {
        let store = MemoryStore::new();
        restore_store(&store, dump)?;
        Ok(Self::InMemory(store))
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Persistent(_))
    }

    /// Short backend name for status output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "memory",
            Self::Persistent(_) => "redb",
        }
    }
}

impl SlotStore for StorageBackend {
    fn read_slot(&self, key: &RecordKey) -> Result<KeySlot, TidemarkError> {
        match self {
            Self::InMemory(store) => store.read_slot(key),
            Self::Persistent(store) => store.read_slot(key),
        }
    }

    fn update_slot<R>(
        &self,
        key: &RecordKey,
        f: impl FnOnce(&mut KeySlot) -> Result<R, TidemarkError>,
    ) -> Result<R, TidemarkError> {
        match self {
            Self::InMemory(store) => store.update_slot(key, f),
            Self::Persistent(store) => store.update_slot(key, f),
        }
    }

    fn slot_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        match self {
            Self::InMemory(store) => store.slot_keys(),
            Self::Persistent(store) => store.slot_keys(),
        }
    }

    fn row_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        match self {
            Self::InMemory(store) => store.row_keys(),
            Self::Persistent(store) => store.row_keys(),
        }
    }

    fn count_rows(&self) -> Result<usize, TidemarkError> {
        match self {
            Self::InMemory(store) => store.count_rows(),
            Self::Persistent(store) => store.count_rows(),
        }
    }

    fn count_versions(&self) -> Result<usize, TidemarkError> {
        match self {
            Self::InMemory(store) => store.count_versions(),
            Self::Persistent(store) => store.count_versions(),
        }
    }
}
