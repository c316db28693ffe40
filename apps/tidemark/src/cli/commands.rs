//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::api::{self, FeedResponse, KeyAuditJson, RevisionsResponse, VersionJson};
use crate::input::{
    MAX_IMPORT_FILE_SIZE, parse_event_line, parse_source_arg, read_snapshot_file,
    validate_file_path, validate_file_size, validate_output_path,
};
use crate::reporting::log_pass_report;
use crate::settings::load_config;
use crate::stream::{StreamReconciler, StreamSummary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tidemark_core::{
    AuditProjector, CurrentStateStore, FeedMetrics, FeedTracker, HistoryStore, Normalizer,
    PassReport, Pipeline, RecordKey, Sequence, StorageBackend, TidemarkError, dump_from_bytes,
    dump_store, dump_to_bytes, restore_store,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Global options shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub database: PathBuf,
    pub backend: String,
    pub config: Option<PathBuf>,
    pub json_mode: bool,
    pub verbose: bool,
}

fn print_json(output: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(output).unwrap_or_default()
    );
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(ctx: &Context, host: &str, port: u16) -> Result<(), TidemarkError> {
    let pipeline = open_pipeline(ctx)?;
    if !pipeline.store().is_persistent() {
        tracing::warn!(
            "File backend: revisions posted to the server are kept in memory and not saved"
        );
    }

    println!("Tidemark Reconciler Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", host);
    println!("  Port:     {}", port);
    println!("  Backend:  {}", ctx.backend);
    println!("  Database: {:?}", ctx.database);
    println!("  Key:      {}", pipeline.config().key_field);
    println!();
    println!("Endpoints:");
    println!("  GET  /current/{{key}} - Current-state row");
    println!("  GET  /history/{{key}} - History versions");
    println!("  GET  /audit          - Audit summary");
    println!("  GET  /audit/{{key}}   - Audit of one key");
    println!("  GET  /feed           - Feed metrics of the last pass");
    println!("  POST /revisions      - Reconcile an event batch");
    println!("  GET  /status         - Table status");
    println!("  POST /export         - Export tables");
    println!("  GET  /health         - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let addr = format!("{}:{}", host, port);
    api::run_server(&addr, pipeline).await
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show table status.
pub fn cmd_status(ctx: &Context) -> Result<(), TidemarkError> {
    let backend = open_backend(&ctx.database, &ctx.backend)?;
    let row_count = backend.row_count()?;
    let version_count = backend.version_count()?;
    let history_keys = backend.history_keys()?.len();

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "database": ctx.database.to_string_lossy(),
            "backend": backend.name(),
            "row_count": row_count,
            "version_count": version_count,
            "history_keys": history_keys
        }));
        return Ok(());
    }

    println!("Tidemark Table Status");
    println!("=====================");
    println!("Database: {:?}", ctx.database);
    println!("Backend:  {}", backend.name());
    println!();
    println!("Current rows:     {}", row_count);
    println!("History versions: {}", version_count);
    println!("Keys with history: {}", history_keys);

    Ok(())
}

// =============================================================================
// SNAPSHOT COMMAND
// =============================================================================

/// Reconcile one full snapshot per source, all taken at the same time.
pub fn cmd_snapshot(
    ctx: &Context,
    inputs: &[String],
    taken_at: Option<&str>,
) -> Result<(), TidemarkError> {
    let taken_at = match taken_at {
        Some(text) => {
            let sequence = Sequence::parse(text);
            if !sequence.is_orderable() {
                return Err(TidemarkError::InvalidConfig(format!(
                    "Invalid --taken-at '{}': expected a counter or an RFC 3339 timestamp",
                    text
                )));
            }
            sequence
        }
        None => now_sequence(),
    };

    let mut records = Vec::new();
    for arg in inputs {
        let (source, path) = parse_source_arg(arg)?;
        let batch = read_snapshot_file(&path, &source)?;
        tracing::info!(source = %source, path = %path.display(), records = batch.len(), "Read snapshot");
        records.extend(batch);
    }

    let pipeline = open_pipeline(ctx)?;
    let report = pipeline.run_snapshot(&records, taken_at)?;
    log_pass_report(&report);
    save_backend(pipeline.store(), &ctx.database)?;

    print_pass_report(&report, ctx.json_mode, ctx.verbose);
    Ok(())
}

/// The current time as a timestamp sequence.
fn now_sequence() -> Sequence {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    Sequence::Timestamp(micros)
}

// =============================================================================
// EVENTS COMMAND
// =============================================================================

/// Reconcile an NDJSON event feed through the stream driver.
pub async fn cmd_events(ctx: &Context, file: &Path, source: &str) -> Result<(), TidemarkError> {
    let config = Arc::new(load_config(ctx.config.as_deref())?);
    let backend = Arc::new(open_backend(&ctx.database, &ctx.backend)?);

    let (summary, feed, rejected) = if file.as_os_str() == "-" {
        let reader = BufReader::new(tokio::io::stdin());
        stream_events(reader, &backend, &config, source).await?
    } else {
        let validated = validate_file_path(file)?;
        let handle = tokio::fs::File::open(&validated)
            .await
            .map_err(|e| TidemarkError::IoError(format!("Open feed: {}", e)))?;
        stream_events(BufReader::new(handle), &backend, &config, source).await?
    };

    save_backend(&backend, &ctx.database)?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "received": summary.received,
            "rejected": rejected,
            "counts": summary.counts,
            "duplicates_dropped": summary.duplicates_dropped,
            "superseded": summary.superseded,
            "conflicts": summary.conflicts,
            "halted": summary.halted,
            "skipped": summary.skipped,
            "failed_shards": summary.failed_shards,
            "feed": FeedResponse::from(&feed)
        }));
    } else {
        println!("Events reconciled");
        println!("=================");
        println!("Received:   {}", summary.received);
        println!("Rejected:   {}", rejected);
        print_counts(&summary.counts);
        println!("Duplicates: {}", summary.duplicates_dropped);
        println!("Superseded: {}", summary.superseded);
        println!("Conflicts:  {}", summary.conflicts);
        print_feed(&feed);
        if !summary.halted.is_empty() {
            println!();
            println!("Halted keys ({}, {} revisions skipped):", summary.halted.len(), summary.skipped);
            for (key, reason) in &summary.halted {
                println!("  {}: {}", key, reason);
            }
        }
    }

    if summary.failed_shards.is_empty() {
        Ok(())
    } else {
        Err(TidemarkError::WorkerFailed(
            summary.failed_shards.first().copied().unwrap_or_default(),
        ))
    }
}

async fn stream_events<R: AsyncBufRead + Unpin>(
    reader: R,
    backend: &Arc<StorageBackend>,
    config: &Arc<tidemark_core::ReconcileConfig>,
    default_source: &str,
) -> Result<(StreamSummary, FeedMetrics, u64), TidemarkError> {
    let stream = StreamReconciler::start(Arc::clone(backend), Arc::clone(config));
    let normalizer = Normalizer::new(config);
    let mut tracker = FeedTracker::default();
    let mut rejected = 0u64;
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| TidemarkError::IoError(format!("Read feed: {}", e)))?
    {
        line_number = line_number.saturating_add(1);
        let record = match parse_event_line(&line, default_source) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(line = line_number, error = %e, "Unparseable event line");
                rejected = rejected.saturating_add(1);
                continue;
            }
        };

        match normalizer.normalize(&record) {
            Ok(revision) => {
                tracker.record(&revision);
                stream.submit(revision).await?;
            }
            Err(reason) => {
                tracing::warn!(
                    line = line_number,
                    source = %record.source,
                    reason = %reason,
                    "Record rejected"
                );
                rejected = rejected.saturating_add(1);
            }
        }
    }

    let summary = stream.finish().await;
    Ok((summary, tracker.finish(), rejected))
}

// =============================================================================
// CURRENT COMMAND
// =============================================================================

/// Show the current-state row of a key.
pub fn cmd_current(ctx: &Context, key: &str) -> Result<(), TidemarkError> {
    let backend = open_backend(&ctx.database, &ctx.backend)?;
    let row = backend.get(&RecordKey::new(key))?;

    if ctx.json_mode {
        let output = match &row {
            Some(row) => serde_json::json!({ "found": true, "row": api::RowJson::from(row) }),
            None => serde_json::json!({ "found": false }),
        };
        print_json(&output);
        return Ok(());
    }

    match row {
        Some(row) => {
            println!("Key {} (as of {}):", row.key, row.sequence);
            for (field, value) in row.payload.iter() {
                println!("  {} = {}", field, value);
            }
        }
        None => println!("Key {} has no current row", key),
    }
    Ok(())
}

// =============================================================================
// HISTORY COMMAND
// =============================================================================

/// Show the history versions of a key.
pub fn cmd_history(ctx: &Context, key: &str, as_of: Option<&str>) -> Result<(), TidemarkError> {
    let backend = open_backend(&ctx.database, &ctx.backend)?;
    let mut versions = backend.list_versions(&RecordKey::new(key))?;

    if let Some(text) = as_of {
        let at = Sequence::parse(text);
        if !at.is_orderable() {
            return Err(TidemarkError::InvalidConfig(format!(
                "Invalid --as-of '{}': expected a counter or an RFC 3339 timestamp",
                text
            )));
        }
        versions.retain(|v| v.covers(&at));
    }

    if ctx.json_mode {
        let rendered: Vec<VersionJson> = versions.iter().map(VersionJson::from).collect();
        print_json(&serde_json::json!({ "key": key, "versions": rendered }));
        return Ok(());
    }

    if versions.is_empty() {
        println!("Key {} has no matching history", key);
        return Ok(());
    }

    println!("History of {} ({} versions):", key, versions.len());
    for version in &versions {
        let until = version
            .valid_to
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "open".to_string());
        let marker = if version.deleted { " [deleted]" } else { "" };
        println!("  [{} .. {}){}", version.valid_from, until, marker);
        if ctx.verbose {
            for (field, value) in version.payload.iter() {
                println!("      {} = {}", field, value);
            }
        }
    }
    Ok(())
}

// =============================================================================
// AUDIT COMMAND
// =============================================================================

/// Audit change categories and activity tiers.
pub fn cmd_audit(ctx: &Context, key: Option<&str>, detailed: bool) -> Result<(), TidemarkError> {
    let pipeline = open_pipeline(ctx)?;

    if let Some(key) = key {
        let record_key = RecordKey::new(key);
        let versions = pipeline.store().list_versions(&record_key)?;
        if versions.is_empty() {
            if ctx.json_mode {
                print_json(&serde_json::json!({ "found": false }));
            } else {
                println!("Key {} has no history", key);
            }
            return Ok(());
        }

        let audit =
            AuditProjector::new(&pipeline.config().audit).project_versions(&record_key, &versions);
        if ctx.json_mode {
            print_json(&serde_json::json!({
                "found": true,
                "audit": KeyAuditJson::from(&audit)
            }));
            return Ok(());
        }

        println!("Audit of {}", audit.key);
        println!("  Versions:    {}", audit.versions);
        println!("  Transitions: {}", audit.transitions);
        println!("  Deletions:   {}", audit.deletions);
        println!("  Tier:        {}", audit.tier.name());
        println!("  Active:      {}", audit.active);
        for (category, count) in &audit.categories {
            println!("  {:<12} {}", category, count);
        }
        return Ok(());
    }

    let report = pipeline.audit()?;
    if ctx.json_mode {
        let mut output =
            serde_json::to_value(api::AuditResponse::from(&report)).unwrap_or_default();
        if detailed {
            let keys: Vec<KeyAuditJson> = report.keys.iter().map(KeyAuditJson::from).collect();
            output["keys"] = serde_json::to_value(keys).unwrap_or_default();
        }
        print_json(&output);
        return Ok(());
    }

    println!("Tidemark Audit");
    println!("==============");
    println!("Keys:        {}", report.key_count());
    println!("Transitions: {}", report.total_transitions);
    println!("Deletions:   {}", report.total_deletions);
    println!();
    println!("Activity tiers:");
    for (tier, count) in &report.tier_counts {
        println!("  {:<10} {}", tier.name(), count);
    }
    println!();
    println!("Change categories:");
    for (category, count) in &report.category_totals {
        println!("  {:<10} {}", category, count);
    }

    if detailed {
        println!();
        println!("Keys:");
        for audit in &report.keys {
            println!(
                "  {} - {} transitions, tier {}{}",
                audit.key,
                audit.transitions,
                audit.tier.name(),
                if audit.active { "" } else { " (inactive)" }
            );
        }
    }
    Ok(())
}

// =============================================================================
// EXPORT COMMAND
// =============================================================================

/// Export both tables as a TDMK dump.
pub fn cmd_export(ctx: &Context, output: &Path) -> Result<(), TidemarkError> {
    let validated_output = validate_output_path(output)?;
    let backend = open_backend(&ctx.database, &ctx.backend)?;

    let dump = dump_store(&backend)?;
    let data = dump_to_bytes(&dump)?;

    std::fs::write(&validated_output, &data)
        .map_err(|e| TidemarkError::IoError(format!("Write file: {}", e)))?;

    println!(
        "Exported {} keys ({} bytes) to {:?}",
        dump.len(),
        data.len(),
        validated_output
    );
    Ok(())
}

// =============================================================================
// IMPORT COMMAND
// =============================================================================

/// Import a TDMK dump, replacing the stored slots of every key it holds.
pub fn cmd_import(ctx: &Context, input: &Path) -> Result<(), TidemarkError> {
    let validated_path = validate_file_path(input)?;
    validate_file_size(&validated_path, MAX_IMPORT_FILE_SIZE)?;

    let data = std::fs::read(&validated_path)
        .map_err(|e| TidemarkError::IoError(format!("Read file: {}", e)))?;
    let dump = dump_from_bytes(&data)?;

    let backend = open_backend(&ctx.database, &ctx.backend)?;
    let restored = restore_store(&backend, dump)?;
    save_backend(&backend, &ctx.database)?;

    println!(
        "Imported {} keys: {} current rows, {} history versions",
        restored,
        backend.row_count()?,
        backend.version_count()?
    );
    Ok(())
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Initialize a new database.
pub fn cmd_init(ctx: &Context, force: bool) -> Result<(), TidemarkError> {
    let db_path = &ctx.database;
    if db_path.exists() && !force {
        return Err(TidemarkError::IoError(
            "Database already exists. Use --force to overwrite.".to_string(),
        ));
    }
    if db_path.exists() {
        std::fs::remove_file(db_path)
            .map_err(|e| TidemarkError::IoError(format!("Remove db: {}", e)))?;
    }

    match ctx.backend.as_str() {
        "redb" => {
            let _backend = StorageBackend::with_redb(db_path)?;
            println!("Initialized new redb database at {:?}", db_path);
        }
        "file" => {
            save_backend(&StorageBackend::default(), db_path)?;
            println!("Initialized new file database at {:?}", db_path);
        }
        other => return Err(unknown_backend(other)),
    }
    Ok(())
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn unknown_backend(name: &str) -> TidemarkError {
    TidemarkError::InvalidConfig(format!("Unknown backend: {}. Use: redb, file", name))
}

/// Open the tables at a database path with the specified backend.
///
/// The file backend loads a TDMK dump into memory; a missing file starts
/// empty.
pub fn open_backend(db_path: &Path, backend: &str) -> Result<StorageBackend, TidemarkError> {
    match backend {
        "redb" => StorageBackend::with_redb(db_path),
        "file" => {
            if !db_path.exists() {
                return Ok(StorageBackend::default());
            }
            validate_file_size(db_path, MAX_IMPORT_FILE_SIZE)?;
            let data = std::fs::read(db_path)
                .map_err(|e| TidemarkError::IoError(format!("Read db: {}", e)))?;
            StorageBackend::from_dump(dump_from_bytes(&data)?)
        }
        other => Err(unknown_backend(other)),
    }
}

/// Persist the tables. A redb backend is already durable.
pub fn save_backend(backend: &StorageBackend, db_path: &Path) -> Result<(), TidemarkError> {
    if backend.is_persistent() {
        return Ok(());
    }
    let data = dump_to_bytes(&dump_store(backend)?)?;
    std::fs::write(db_path, &data).map_err(|e| TidemarkError::IoError(format!("Write db: {}", e)))
}

/// Open the backend and wrap it in a pipeline with the run's configuration.
pub fn open_pipeline(ctx: &Context) -> Result<Pipeline<StorageBackend>, TidemarkError> {
    let config = load_config(ctx.config.as_deref())?;
    let backend = open_backend(&ctx.database, &ctx.backend)?;
    Pipeline::new(config, backend)
}

fn print_counts(counts: &tidemark_core::ApplyCounts) {
    println!("Inserted:   {}", counts.inserted);
    println!("Updated:    {}", counts.updated);
    println!("Refreshed:  {}", counts.refreshed);
    println!("Unchanged:  {}", counts.unchanged);
    println!("Deleted:    {}", counts.deleted);
    println!("Absent:     {}", counts.absent);
    println!("Stale:      {}", counts.stale);
}

fn print_feed(feed: &FeedMetrics) {
    if feed.by_source.is_empty() {
        return;
    }
    println!();
    println!("Feed by source:");
    for (source, f) in &feed.by_source {
        let range = match (&f.min_sequence, &f.max_sequence) {
            (Some(min), Some(max)) => format!("{} .. {}", min, max),
            _ => "-".to_string(),
        };
        println!(
            "  {:<12} {} events ({} upserts, {} deletes), range {}, gaps {}",
            source.to_string(),
            f.events,
            f.upserts,
            f.deletes,
            range,
            f.counter_gaps
        );
    }
}

/// Print a pass report, as JSON or as a text summary.
fn print_pass_report(report: &PassReport, json_mode: bool, verbose: bool) {
    if json_mode {
        print_json(&serde_json::json!({
            "mode": format!("{:?}", report.mode),
            "result": RevisionsResponse::from_report(report),
            "synthesized_deletes": report.synthesized_deletes,
            "feed": FeedResponse::from(&report.feed)
        }));
        return;
    }

    println!("Pass complete ({:?})", report.mode);
    println!("==================");
    println!("Events:     {}", report.feed.total_events);
    println!("Rejected:   {}", report.rejected.len());
    print_counts(&report.totals);
    println!("Synthesized deletes: {}", report.synthesized_deletes);
    println!("Superseded: {}", report.superseded);
    println!("Duplicates: {}", report.duplicates_dropped);
    print_feed(&report.feed);

    let failed: Vec<_> = report.failed_keys().collect();
    if !failed.is_empty() {
        println!();
        println!("Halted keys ({}):", failed.len());
        for outcome in failed {
            if let Some(failure) = &outcome.failure {
                println!("  {}: {}", outcome.key, failure.reason);
            }
        }
    }

    if verbose {
        let conflicts: Vec<_> = report.ambiguous_conflicts().collect();
        if !conflicts.is_empty() {
            println!();
            println!("Ambiguous conflicts ({}):", conflicts.len());
            for conflict in conflicts {
                println!(
                    "  {} field {} at {}: kept {}",
                    conflict.key, conflict.field, conflict.sequence, conflict.winner
                );
            }
        }
    }
}
