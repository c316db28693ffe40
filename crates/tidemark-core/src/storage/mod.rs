//! # Persistent Storage
//!
//! Disk-backed implementation of the store traits.

mod redb_store;

pub use redb_store::RedbStore;
