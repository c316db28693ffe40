//! # Dump Format
//!
//! Binary serialization of a whole store (both tables and the watermarks).
//! Used by the file backend and by export/import; file I/O stays in the
//! app layer.
//!
//! Format: Header (5 bytes) + postcard-serialized [`TableDump`].
//! - 4 bytes: Magic ("TDMK")
//! - 1 byte: Version
//!
//! Size and header are validated before the payload is decoded.

use serde::{Deserialize, Serialize};

use crate::primitives;
use crate::store::{KeySlot, SlotStore};
use crate::types::{RecordKey, TidemarkError};

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum accepted dump size (500 MB), checked before decoding.
pub const MAX_DUMP_SIZE: usize = 500 * 1024 * 1024;

const HEADER_LEN: usize = 5;

// =============================================================================
// FILE HEADER
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DumpHeader {
    pub magic: [u8; 4],
    pub version: u8,
}

impl DumpHeader {
    /// Create a new header with current format version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            magic: *primitives::MAGIC_BYTES,
            version: primitives::FORMAT_VERSION,
        }
    }

    pub fn validate(&self) -> Result<(), TidemarkError> {
        if &self.magic != primitives::MAGIC_BYTES {
            return Err(TidemarkError::SerializationError(
                "Invalid magic bytes".to_string(),
            ));
        }
        if self.version != primitives::FORMAT_VERSION {
            return Err(TidemarkError::SerializationError(format!(
                "Unsupported version: {} (expected {})",
                self.version,
                primitives::FORMAT_VERSION
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let [a, b, c, d] = self.magic;
        [a, b, c, d, self.version]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TidemarkError> {
        match bytes {
            [a, b, c, d, version, ..] => Ok(Self {
                magic: [*a, *b, *c, *d],
                version: *version,
            }),
            _ => Err(TidemarkError::SerializationError(
                "Header too short".to_string(),
            )),
        }
    }
}

impl Default for DumpHeader {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TABLE DUMP
// =============================================================================

/// Every stored slot, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDump {
    pub slots: Vec<(RecordKey, KeySlot)>,
}

impl TableDump {
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Read every slot of a store.
///
/// Keys with a watermark but no row or history (a delete of an unknown key)
/// are not listed by the store traits, so the union of row and history keys
/// is dumped.
pub fn dump_store<S: SlotStore>(store: &S) -> Result<TableDump, TidemarkError> {
    let mut keys = store.slot_keys()?;
    keys.extend(store.row_keys()?);
    keys.sort();
    keys.dedup();

    let mut slots = Vec::with_capacity(keys.len());
    for key in keys {
        let slot = store.read_slot(&key)?;
        if !slot.is_empty() {
            slots.push((key, slot));
        }
    }
    Ok(TableDump { slots })
}

/// Write every slot of a dump into a store, replacing what it held for
/// those keys.
pub fn restore_store<S: SlotStore>(store: &S, dump: TableDump) -> Result<usize, TidemarkError> {
    let mut restored = 0usize;
    for (key, slot) in dump.slots {
        store.update_slot(&key, |stored| {
            *stored = slot;
            Ok(())
        })?;
        restored = restored.saturating_add(1);
    }
    Ok(restored)
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Serialize a dump to bytes (header + payload).
pub fn dump_to_bytes(dump: &TableDump) -> Result<Vec<u8>, TidemarkError> {
    let payload =
        postcard::to_stdvec(dump).map_err(|e| TidemarkError::SerializationError(e.to_string()))?;

    let mut result = Vec::with_capacity(HEADER_LEN + payload.len());
    result.extend_from_slice(&DumpHeader::new().to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize a dump from bytes.
///
/// Validates, in order: minimum size, maximum size, header magic and
/// version. The payload is only decoded after all three pass.
pub fn dump_from_bytes(bytes: &[u8]) -> Result<TableDump, TidemarkError> {
    if bytes.len() < HEADER_LEN {
        return Err(TidemarkError::SerializationError(format!(
            "Data too short: minimum {HEADER_LEN} bytes required"
        )));
    }
    if bytes.len() > MAX_DUMP_SIZE {
        return Err(TidemarkError::SerializationError(format!(
            "Data size {} bytes exceeds maximum allowed {} bytes",
            bytes.len(),
            MAX_DUMP_SIZE
        )));
    }

    let header = DumpHeader::from_bytes(bytes)?;
    header.validate()?;

    let payload = bytes.get(HEADER_LEN..).unwrap_or_default();
    postcard::from_bytes(payload).map_err(|e| {
        TidemarkError::SerializationError(format!("Failed to deserialize dump data: {e}"))
    })
}

// =============================================================================
// TESTS
// =============================================================================
