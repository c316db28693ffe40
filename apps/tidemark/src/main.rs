//! # Tidemark - Change Reconciler
//!
//! The main binary for the Tidemark reconciliation engine.
//!
//! This application provides:
//! - CLI interface for snapshot and event passes, and table lookups
//! - Streaming driver for unbounded event feeds
//! - HTTP REST API server (axum-based)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     apps/tidemark (THE BINARY)                  │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐    │
//! │  │   CLI       │    │   HTTP API  │    │  Stream Driver   │    │
//! │  │  (clap)     │    │   (axum)    │    │ (shard workers)  │    │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘    │
//! │         │                  │                    │               │
//! │         └──────────────────┼────────────────────┘               │
//! │                            ▼                                    │
//! │                    ┌───────────────┐                            │
//! │                    │ tidemark-core │                            │
//! │                    │  (THE LOGIC)  │                            │
//! │                    └───────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Reconcile a two-source snapshot
//! tidemark snapshot -i mongodb=mongo.json -i mssql=mssql.json --taken-at 2024-03-01T00:00:00Z
//!
//! # Reconcile an event feed
//! tidemark events -f changes.ndjson
//!
//! # Look things up
//! tidemark current 12345678901
//! tidemark history 12345678901 --as-of 2024-02-01T00:00:00Z
//!
//! # Start the HTTP server
//! tidemark server --host 0.0.0.0 --port 8080
//! ```

use clap::Parser;
use tidemark::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // TIDEMARK_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("TIDEMARK_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tidemark=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Tidemark startup banner.
fn print_banner() {
    eprintln!(
        r#"
  ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
   T I D E M A R K
  ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

  Change Reconciler v{}

  Current state • Full history • Audit
"#,
        env!("CARGO_PKG_VERSION")
    );
}
