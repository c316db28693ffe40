//! # Input Readers
//!
//! Converts what the ingestion layer hands over into [`RawRecord`]s.
//!
//! - Snapshot files: one JSON array of objects per source system
//! - Event feeds: NDJSON, one object per line; the source system is read
//!   from the `source_system` field, falling back to a default
//!
//! JSON scalars map onto [`FieldValue`]: integers stay integers, every
//! other number is kept as its decimal text, arrays and objects are kept as
//! compact JSON text.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tidemark_core::{
    FieldValue, RawRecord, TidemarkError,
    primitives::{DEFAULT_SOURCE_FIELD, MAX_BATCH_LENGTH},
};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum snapshot file size (100 MB).
pub const MAX_SNAPSHOT_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum dump file size for import (500 MB).
pub const MAX_IMPORT_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Validate file size before reading.
pub fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TidemarkError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TidemarkError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(TidemarkError::SerializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve an input path: it must exist and be a regular file.
pub fn validate_file_path(path: &Path) -> Result<PathBuf, TidemarkError> {
    let canonical = path.canonicalize().map_err(|e| {
        TidemarkError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(TidemarkError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Resolve an output path: its parent directory must exist.
pub fn validate_output_path(path: &Path) -> Result<PathBuf, TidemarkError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        TidemarkError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(TidemarkError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| TidemarkError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

// =============================================================================
// JSON CONVERSION
// =============================================================================

/// Map one JSON value onto a field value.
#[must_use]
pub fn json_to_field(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Text(n.to_string()),
        },
        Value::String(s) => FieldValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => FieldValue::Text(value.to_string()),
    }
}

/// Map a field value back to JSON.
#[must_use]
pub fn field_to_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(*b),
        FieldValue::Int(i) => Value::from(*i),
        FieldValue::Text(s) => Value::String(s.clone()),
    }
}

/// Build a raw record from one JSON object.
///
/// The source is the object's `source_system` text when present,
/// `default_source` otherwise.
pub fn record_from_json(value: Value, default_source: &str) -> Result<RawRecord, TidemarkError> {
    let Value::Object(object) = value else {
        return Err(TidemarkError::SerializationError(
            "Record must be a JSON object".to_string(),
        ));
    };

    let source = match object.get(DEFAULT_SOURCE_FIELD) {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default_source.to_string(),
    };

    let mut record = RawRecord::new(source);
    for (name, value) in &object {
        record.fields.insert(name.clone(), json_to_field(value));
    }
    Ok(record)
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Parse a `source=path` snapshot argument.
pub fn parse_source_arg(arg: &str) -> Result<(String, PathBuf), TidemarkError> {
    match arg.split_once('=') {
        Some((source, path)) if !source.trim().is_empty() && !path.trim().is_empty() => {
            Ok((source.trim().to_string(), PathBuf::from(path.trim())))
        }
        _ => Err(TidemarkError::InvalidConfig(format!(
            "Expected SOURCE=PATH, got '{}'",
            arg
        ))),
    }
}

/// Parse a snapshot: a JSON array of objects from one source.
pub fn parse_snapshot(bytes: &[u8], source: &str) -> Result<Vec<RawRecord>, TidemarkError> {
    let values: Vec<Value> = serde_json::from_slice(bytes)
        .map_err(|e| TidemarkError::SerializationError(format!("Snapshot JSON: {}", e)))?;

    if values.len() > MAX_BATCH_LENGTH {
        return Err(TidemarkError::BatchTooLarge {
            len: values.len(),
            max: MAX_BATCH_LENGTH,
        });
    }

    values
        .into_iter()
        .map(|value| record_from_json(value, source))
        .collect()
}

/// Read a snapshot file from one source.
pub fn read_snapshot_file(path: &Path, source: &str) -> Result<Vec<RawRecord>, TidemarkError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, MAX_SNAPSHOT_FILE_SIZE)?;

    let bytes = std::fs::read(&validated)
        .map_err(|e| TidemarkError::IoError(format!("Read file: {}", e)))?;
    parse_snapshot(&bytes, source)
}

// =============================================================================
// EVENT FEEDS
// =============================================================================

/// Parse one NDJSON line. Blank lines yield `None`.
pub fn parse_event_line(
    line: &str,
    default_source: &str,
) -> Result<Option<RawRecord>, TidemarkError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| TidemarkError::SerializationError(format!("Event JSON: {}", e)))?;
    record_from_json(value, default_source).map(Some)
}

// =============================================================================
// TESTS
// =============================================================================
