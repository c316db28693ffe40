//! # Tidemark Application Library
//!
//! Everything the binary does, exposed for integration tests:
//! - [`api`]: HTTP REST API over the derived tables
//! - [`cli`]: command-line interface
//! - [`input`]: JSON / NDJSON readers producing raw records
//! - [`reporting`]: structured logging of pass reports
//! - [`settings`]: TOML configuration loading
//! - [`stream`]: continuous, sharded event reconciliation

pub mod api;
pub mod cli;
pub mod input;
pub mod reporting;
pub mod settings;
pub mod stream;
