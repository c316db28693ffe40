//! # redb-backed Change Store
//!
//! A disk-backed store for both output tables using the redb embedded
//! database:
//! - ACID transactions (one write transaction per key commit)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (readers never block the writer)
//!
//! ## Layout
//!
//! | Table | Key | Value |
//! |-------|-----|-------|
//! | `current` | record key | postcard `CurrentStateRow` |
//! | `history` | (record key, version index) | postcard `HistoryVersion` |
//! | `history_keys` | record key | version count |
//! | `watermarks` | record key | postcard `Watermark` |
//!
//! Version indexes are dense per key, so a range scan over
//! `(key, 0)..=(key, u64::MAX)` returns a key's versions in `valid_from`
//! order. `history_keys` lists every key with versions without scanning
//! them.

use redb::{
    AccessGuard, Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::Path;

use crate::store::{KeySlot, SlotStore};
use crate::types::{RecordKey, TidemarkError};

/// Table for current rows: record key -> serialized CurrentStateRow
const CURRENT: TableDefinition<&str, &[u8]> = TableDefinition::new("current");

/// Table for history: (record key, version index) -> serialized HistoryVersion
const HISTORY: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("history");

/// Index of keys with history: record key -> version count
const HISTORY_KEYS: TableDefinition<&str, u64> = TableDefinition::new("history_keys");

/// Table for watermarks: record key -> serialized Watermark
const WATERMARKS: TableDefinition<&str, &[u8]> = TableDefinition::new("watermarks");

pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

fn io_err(e: impl std::fmt::Display) -> TidemarkError {
    TidemarkError::IoError(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TidemarkError> {
    postcard::to_allocvec(value).map_err(|e| TidemarkError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TidemarkError> {
    postcard::from_bytes(bytes).map_err(|e| TidemarkError::SerializationError(e.to_string()))
}

fn decode_entry<T: DeserializeOwned>(
    entry: Option<AccessGuard<'_, &'static [u8]>>,
) -> Result<Option<T>, TidemarkError> {
    entry.map(|guard| decode(guard.value())).transpose()
}

/// Read everything stored for one key from any readable view of the tables.
fn load_slot(
    current: &impl ReadableTable<&'static str, &'static [u8]>,
    history: &impl ReadableTable<(&'static str, u64), &'static [u8]>,
    watermarks: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &RecordKey,
) -> Result<KeySlot, TidemarkError> {
    let row = decode_entry(current.get(key.as_str()).map_err(io_err)?)?;
    let watermark = decode_entry(watermarks.get(key.as_str()).map_err(io_err)?)?;

    let mut versions = Vec::new();
    for entry in history
        .range((key.as_str(), 0u64)..=(key.as_str(), u64::MAX))
        .map_err(io_err)?
    {
        let (_, value) = entry.map_err(io_err)?;
        versions.push(decode(value.value())?);
    }

    Ok(KeySlot {
        row,
        versions,
        watermark,
    })
}

impl RedbStore {
    /// Open or create a store database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TidemarkError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(io_err)?;
            let _ = write_txn.open_table(CURRENT).map_err(io_err)?;
            let _ = write_txn.open_table(WATERMARKS).map_err(io_err)?;
            {
                let history = write_txn.open_table(HISTORY).map_err(io_err)?;
                let mut index = write_txn.open_table(HISTORY_KEYS).map_err(io_err)?;
                if index.is_empty().map_err(io_err)? && !history.is_empty().map_err(io_err)? {
                    rebuild_history_index(&history, &mut index)?;
                }
            }
            write_txn.commit().map_err(io_err)?;
        }

        Ok(Self { db })
    }
}

/// Count the versions of every key, for databases written without the index.
fn rebuild_history_index(
    history: &impl ReadableTable<(&'static str, u64), &'static [u8]>,
    index: &mut redb::Table<'_, &'static str, u64>,
) -> Result<(), TidemarkError> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for entry in history.iter().map_err(io_err)? {
        let (key, _) = entry.map_err(io_err)?;
        let (name, _) = key.value();
        let count = counts.entry(name.to_string()).or_default();
        *count = count.saturating_add(1);
    }
    for (name, count) in &counts {
        index.insert(name.as_str(), *count).map_err(io_err)?;
    }
    Ok(())
}

impl SlotStore for RedbStore {
    fn read_slot(&self, key: &RecordKey) -> Result<KeySlot, TidemarkError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let current = read_txn.open_table(CURRENT).map_err(io_err)?;
        let history = read_txn.open_table(HISTORY).map_err(io_err)?;
        let watermarks = read_txn.open_table(WATERMARKS).map_err(io_err)?;
        load_slot(&current, &history, &watermarks, key)
    }

    fn update_slot<R>(
        &self,
        key: &RecordKey,
        f: impl FnOnce(&mut KeySlot) -> Result<R, TidemarkError>,
    ) -> Result<R, TidemarkError> {
        let write_txn = self.db.begin_write().map_err(io_err)?;
        let result = {
            let mut current = write_txn.open_table(CURRENT).map_err(io_err)?;
            let mut history = write_txn.open_table(HISTORY).map_err(io_err)?;
            let mut history_keys = write_txn.open_table(HISTORY_KEYS).map_err(io_err)?;
            let mut watermarks = write_txn.open_table(WATERMARKS).map_err(io_err)?;

            let before = load_slot(&current, &history, &watermarks, key)?;
            let mut slot = before.clone();
            let result = match f(&mut slot) {
                Ok(result) => result,
                Err(e) => {
                    drop((current, history, history_keys, watermarks));
                    write_txn.abort().map_err(io_err)?;
                    return Err(e);
                }
            };

            if slot.row != before.row {
                match &slot.row {
                    Some(row) => {
                        current
                            .insert(key.as_str(), encode(row)?.as_slice())
                            .map_err(io_err)?;
                    }
                    None => {
                        current.remove(key.as_str()).map_err(io_err)?;
                    }
                }
            }

            // Usually only the tail changes; a restored slot may differ
            // anywhere, and may be shorter.
            let unchanged = before
                .versions
                .iter()
                .zip(&slot.versions)
                .take_while(|(old, new)| old == new)
                .count();
            for idx in slot.versions.len()..before.versions.len() {
                history.remove((key.as_str(), idx as u64)).map_err(io_err)?;
            }
            for (idx, version) in slot.versions.iter().enumerate().skip(unchanged) {
                history
                    .insert((key.as_str(), idx as u64), encode(version)?.as_slice())
                    .map_err(io_err)?;
            }
            if slot.versions.len() != before.versions.len() {
                if slot.versions.is_empty() {
                    history_keys.remove(key.as_str()).map_err(io_err)?;
                } else {
                    history_keys
                        .insert(key.as_str(), slot.versions.len() as u64)
                        .map_err(io_err)?;
                }
            }

            if slot.watermark != before.watermark {
                match &slot.watermark {
                    Some(watermark) => {
                        watermarks
                            .insert(key.as_str(), encode(watermark)?.as_slice())
                            .map_err(io_err)?;
                    }
                    None => {
                        watermarks.remove(key.as_str()).map_err(io_err)?;
                    }
                }
            }
            result
        };
        write_txn.commit().map_err(io_err)?;
        Ok(result)
    }

    fn slot_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let history_keys = read_txn.open_table(HISTORY_KEYS).map_err(io_err)?;

        let mut keys = Vec::new();
        for entry in history_keys.iter().map_err(io_err)? {
            let (key, _) = entry.map_err(io_err)?;
            keys.push(RecordKey::new(key.value()));
        }
        Ok(keys)
    }

    fn row_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let current = read_txn.open_table(CURRENT).map_err(io_err)?;

        let mut keys = Vec::new();
        for entry in current.iter().map_err(io_err)? {
            let (key, _) = entry.map_err(io_err)?;
            keys.push(RecordKey::new(key.value()));
        }
        Ok(keys)
    }

    fn count_rows(&self) -> Result<usize, TidemarkError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let current = read_txn.open_table(CURRENT).map_err(io_err)?;
        let count = current.len().map_err(io_err)?;
        Ok(count as usize)
    }

    fn count_versions(&self) -> Result<usize, TidemarkError> {
        let read_txn = self.db.begin_read().map_err(io_err)?;
        let history = read_txn.open_table(HISTORY).map_err(io_err)?;
        let count = history.len().map_err(io_err)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeStore, CurrentStateStore, HistoryStore, HistoryWrite, KeyChange, RowWrite};
    use crate::types::{
        CurrentStateRow, FieldValue, HistoryVersion, Payload, Sequence, Watermark,
    };
    use tempfile::tempdir;

    fn payload(email: &str) -> Payload {
        Payload::new().with("email", FieldValue::text(email))
    }

    fn insert_change(key: &RecordKey, n: u64, email: &str) -> KeyChange {
        KeyChange {
            row: RowWrite::Put(CurrentStateRow {
                key: key.clone(),
                payload: payload(email),
                sequence: Sequence::Counter(n),
            }),
            history: HistoryWrite::Open(HistoryVersion::open(
                key.clone(),
                payload(email),
                Sequence::Counter(n),
            )),
            watermark: Watermark {
                sequence: Sequence::Counter(n),
                precedence: 0,
            },
        }
    }

    #[test]
    fn commit_persists_across_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("test.redb");
        let key = RecordKey::new("111");

        {
            let store = RedbStore::open(&db_path).expect("open db");
            store
                .commit(&key, insert_change(&key, 1, "a@x.com"))
                .expect("commit");
        }

        {
            let store = RedbStore::open(&db_path).expect("reopen db");
            let row = store.get(&key).expect("get").expect("row present");
            assert_eq!(row.sequence, Sequence::Counter(1));
            assert_eq!(store.version_count().expect("count"), 1);
            assert_eq!(
                store.watermark(&key).expect("watermark").map(|w| w.sequence),
                Some(Sequence::Counter(1))
            );
        }
    }

    #[test]
    fn failed_commit_is_rolled_back() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let key = RecordKey::new("111");

        store
            .commit(&key, insert_change(&key, 1, "a@x.com"))
            .expect("first commit");
        let second = store.commit(&key, insert_change(&key, 2, "b@x.com"));
        assert!(matches!(second, Err(TidemarkError::OpenVersionExists(_))));

        let row = store.get(&key).expect("get").expect("row present");
        assert_eq!(row.payload, payload("a@x.com"));
        assert_eq!(store.list_versions(&key).expect("versions").len(), 1);
    }

    #[test]
    fn close_rewrites_only_last_version() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        let key = RecordKey::new("111");

        store
            .commit(&key, insert_change(&key, 1, "a@x.com"))
            .expect("insert");
        store
            .commit(
                &key,
                KeyChange {
                    row: RowWrite::Put(CurrentStateRow {
                        key: key.clone(),
                        payload: payload("b@x.com"),
                        sequence: Sequence::Counter(4),
                    }),
                    history: HistoryWrite::Supersede {
                        at: Sequence::Counter(4),
                        next: HistoryVersion::open(key.clone(), payload("b@x.com"), Sequence::Counter(4)),
                    },
                    watermark: Watermark {
                        sequence: Sequence::Counter(4),
                        precedence: 0,
                    },
                },
            )
            .expect("update");

        let versions = store.list_versions(&key).expect("versions");
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].valid_to, Some(Sequence::Counter(4)));
        assert!(versions[1].is_current());
        assert_eq!(
            store
                .version_at(&key, &Sequence::Counter(2))
                .expect("as of")
                .map(|v| v.payload),
            Some(payload("a@x.com"))
        );
    }

    #[test]
    fn keys_listed_in_order() {
        let temp = tempdir().expect("temp dir");
        let store = RedbStore::open(temp.path().join("test.redb")).expect("open db");
        for name in ["c", "a", "b"] {
            let key = RecordKey::new(name);
            store
                .commit(&key, insert_change(&key, 1, "x@x.com"))
                .expect("commit");
        }
        let names: Vec<String> = store.keys().expect("keys").into_iter().map(|k| k.0).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(store.history_keys().expect("history keys").len(), 3);
        assert_eq!(store.row_count().expect("rows"), 3);
    }
}
