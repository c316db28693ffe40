//! # Configuration Loading
//!
//! A key space is described by a TOML file (`--config <path>`). Without a
//! file the built-in user-identity key space is used.
//!
//! Fields missing from the file take the engine defaults. The loaded
//! configuration is always validated before it is returned.
//!
//! ```toml
//! key_field = "cpf"
//! tracked_fields = ["email", "delivery_address"]
//!
//! [precedence]
//! default_order = ["mssql", "mongodb"]
//!
//! [precedence.fields]
//! email = ["mongodb", "mssql"]
//! ```

use std::path::Path;
use tidemark_core::{ReconcileConfig, TidemarkError};

/// Maximum configuration file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Load the configuration for a run.
pub fn load_config(path: Option<&Path>) -> Result<ReconcileConfig, TidemarkError> {
    let Some(path) = path else {
        let config = ReconcileConfig::user_identity();
        config.validate()?;
        return Ok(config);
    };

    let metadata = std::fs::metadata(path).map_err(|e| {
        TidemarkError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
    })?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(TidemarkError::InvalidConfig(format!(
            "Config file size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_CONFIG_FILE_SIZE
        )));
    }

    let text = std::fs::read_to_string(path)
        .map_err(|e| TidemarkError::IoError(format!("Read config: {}", e)))?;
    let config = parse_config(&text)?;
    tracing::info!(
        path = %path.display(),
        key_field = %config.key_field,
        shard_count = config.shard_count,
        "Loaded configuration"
    );
    Ok(config)
}

/// Parse and validate a TOML configuration.
pub fn parse_config(text: &str) -> Result<ReconcileConfig, TidemarkError> {
    let config: ReconcileConfig =
        toml::from_str(text).map_err(|e| TidemarkError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

// =============================================================================
// TESTS
// =============================================================================
