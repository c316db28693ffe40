//! # Serialization Formats
//!
//! Pure byte-level encodings; reading and writing files is the app's job.

pub mod persistence;

pub use persistence::{
    DumpHeader, MAX_DUMP_SIZE, TableDump, dump_from_bytes, dump_store, dump_to_bytes,
    restore_store,
};
