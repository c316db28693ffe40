//! In-memory store striped by key hash.
//!
//! Each stripe is a `Mutex<BTreeMap<RecordKey, KeySlot>>`; a commit locks only
//! the stripe of its key, so workers reconciling different shards rarely
//! contend and there is no global lock.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{KeySlot, SlotStore};
use crate::primitives::{DEFAULT_SHARD_COUNT, MAX_SHARD_COUNT, shard_for};
use crate::types::{RecordKey, TidemarkError};

type Stripe = BTreeMap<RecordKey, KeySlot>;

#[derive(Debug)]
pub struct MemoryStore {
    stripes: Vec<Mutex<Stripe>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_SHARD_COUNT)
    }

    /// Create a store with `count` lock stripes (clamped to `1..=MAX_SHARD_COUNT`).
    #[must_use]
    pub fn with_stripes(count: usize) -> Self {
        let count = count.clamp(1, MAX_SHARD_COUNT);
        Self {
            stripes: (0..count).map(|_| Mutex::new(BTreeMap::new())).collect(),
        }
    }

    /// Build a store holding the given slots.
    pub fn from_slots(
        slots: impl IntoIterator<Item = (RecordKey, KeySlot)>,
    ) -> Result<Self, TidemarkError> {
        let store = Self::new();
        for (key, slot) in slots {
            store.update_slot(&key, |stored| {
                *stored = slot;
                Ok(())
            })?;
        }
        Ok(store)
    }

    fn stripe(&self, key: &RecordKey) -> Result<MutexGuard<'_, Stripe>, TidemarkError> {
        let idx = shard_for(key, self.stripes.len());
        let stripe = self
            .stripes
            .get(idx)
            .ok_or_else(|| TidemarkError::StoreError(format!("stripe {idx} out of range")))?;
        lock(stripe)
    }

    fn collect_keys(
        &self,
        keep: impl Fn(&KeySlot) -> bool,
    ) -> Result<Vec<RecordKey>, TidemarkError> {
        let mut keys = Vec::new();
        for stripe in &self.stripes {
            let guard = lock(stripe)?;
            keys.extend(
                guard
                    .iter()
                    .filter(|(_, slot)| keep(slot))
                    .map(|(k, _)| k.clone()),
            );
        }
        keys.sort();
        Ok(keys)
    }

    fn sum_slots(&self, measure: impl Fn(&KeySlot) -> usize) -> Result<usize, TidemarkError> {
        let mut total = 0usize;
        for stripe in &self.stripes {
            let guard = lock(stripe)?;
            total = guard
                .values()
                .fold(total, |acc, slot| acc.saturating_add(measure(slot)));
        }
        Ok(total)
    }
}

fn lock(stripe: &Mutex<Stripe>) -> Result<MutexGuard<'_, Stripe>, TidemarkError> {
    stripe
        .lock()
        .map_err(|_| TidemarkError::StoreError("memory store stripe lock poisoned".to_string()))
}

impl SlotStore for MemoryStore {
    fn read_slot(&self, key: &RecordKey) -> Result<KeySlot, TidemarkError> {
        Ok(self.stripe(key)?.get(key).cloned().unwrap_or_default())
    }

    fn update_slot<R>(
        &self,
        key: &RecordKey,
        f: impl FnOnce(&mut KeySlot) -> Result<R, TidemarkError>,
    ) -> Result<R, TidemarkError> {
        let mut stripe = self.stripe(key)?;
        let slot = stripe.entry(key.clone()).or_default();
        let result = f(slot);
        if slot.is_empty() {
            stripe.remove(key);
        }
        result
    }

    fn slot_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        self.collect_keys(|slot| !slot.versions.is_empty())
    }

    fn row_keys(&self) -> Result<Vec<RecordKey>, TidemarkError> {
        self.collect_keys(|slot| slot.row.is_some())
    }

    fn count_rows(&self) -> Result<usize, TidemarkError> {
        self.sum_slots(|slot| usize::from(slot.row.is_some()))
    }

    fn count_versions(&self) -> Result<usize, TidemarkError> {
        self.sum_slots(|slot| slot.versions.len())
    }
}
