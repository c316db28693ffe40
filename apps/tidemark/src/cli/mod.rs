//! # Tidemark CLI Module
//!
//! ## Available Commands
//!
//! - `init` - Initialize a new table database
//! - `snapshot` - Reconcile full snapshots (one JSON file per source)
//! - `events` - Reconcile an NDJSON event feed through the stream driver
//! - `current` - Show the current-state row of a key
//! - `history` - Show the history versions of a key
//! - `audit` - Change categories and activity tiers
//! - `status` - Table sizes
//! - `export` - Export both tables as a TDMK dump
//! - `import` - Import a TDMK dump
//! - `server` - Start the HTTP server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tidemark_core::TidemarkError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Tidemark - Change Reconciler
///
/// Merges revisions from several source systems into a current-state table
/// and a full-history table.
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the table database
    #[arg(short = 'D', long, global = true, default_value = "tidemark.db")]
    pub database: PathBuf,

    /// Storage backend: "redb" (ACID database) or "file" (TDMK dump file)
    #[arg(short = 'B', long, global = true, default_value = "redb")]
    pub backend: String,

    /// Key-space configuration (TOML); defaults to the user-identity key space
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Show table status
    Status,

    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Reconcile full snapshots, one JSON array file per source
    Snapshot {
        /// SOURCE=PATH, repeatable (e.g. -i mongodb=mongo.json -i mssql=mssql.json)
        #[arg(short, long = "input", required = true)]
        inputs: Vec<String>,

        /// Snapshot time (counter or RFC 3339); defaults to now
        #[arg(short, long)]
        taken_at: Option<String>,
    },

    /// Reconcile an NDJSON event feed ("-" reads stdin)
    Events {
        /// Path to the NDJSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Source for events without a source_system field
        #[arg(short, long, default_value = "events")]
        source: String,
    },

    /// Show the current-state row of a key
    Current {
        /// Business key
        key: String,
    },

    /// Show the history versions of a key
    History {
        /// Business key
        key: String,

        /// Only the version valid at this sequence (counter or RFC 3339)
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Audit change categories and activity tiers
    Audit {
        /// Audit a single key
        key: Option<String>,

        /// List every key's summary
        #[arg(short, long)]
        detailed: bool,
    },

    /// Export both tables as a TDMK dump
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import a TDMK dump into the database
    Import {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), TidemarkError> {
    let ctx = Context {
        database: cli.database,
        backend: cli.backend,
        config: cli.config,
        json_mode: cli.json_mode,
        verbose: cli.verbose,
    };

    match cli.command {
        Some(Commands::Server { host, port }) => cmd_server(&ctx, &host, port).await,
        Some(Commands::Status) | None => cmd_status(&ctx),
        Some(Commands::Init { force }) => cmd_init(&ctx, force),
        Some(Commands::Snapshot { inputs, taken_at }) => {
            cmd_snapshot(&ctx, &inputs, taken_at.as_deref())
        }
        Some(Commands::Events { file, source }) => cmd_events(&ctx, &file, &source).await,
        Some(Commands::Current { key }) => cmd_current(&ctx, &key),
        Some(Commands::History { key, as_of }) => cmd_history(&ctx, &key, as_of.as_deref()),
        Some(Commands::Audit { key, detailed }) => cmd_audit(&ctx, key.as_deref(), detailed),
        Some(Commands::Export { output }) => cmd_export(&ctx, &output),
        Some(Commands::Import { input }) => cmd_import(&ctx, &input),
    }
}
