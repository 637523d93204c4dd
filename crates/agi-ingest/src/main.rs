//! AGI Ingest - log ingestion pipeline

use agi_common::logging::{init_logging, LogConfig, LogLevel};
use agi_ingest::config::IngestConfig;
use agi_ingest::patterns::Patterns;
use agi_ingest::pipeline;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agi-ingest")]
#[command(author, version, about = "Download, unpack and normalize database logs")]
struct Cli {
    /// YAML settings file; LOGINGEST_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generic log patterns file (overrides patterns_file from the settings)
    #[arg(short, long)]
    patterns: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("agi-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::load(cli.config.as_deref()).context("Failed to load settings")?;
    let patterns = match cli.patterns.as_ref().or(config.patterns_file.as_ref()) {
        Some(path) => Patterns::load(path)
            .with_context(|| format!("Failed to load patterns from {}", path.display()))?,
        None => Patterns::default(),
    };
    info!(
        patterns = patterns.generic_logs.len(),
        read_only = config.directories.read_only_input,
        "Starting ingest"
    );

    let summary = pipeline::run_with_config(config, patterns).await?;
    info!(
        rounds = summary.unpack.rounds,
        extracted = summary.unpack.extracted,
        logs = summary.pre_process.logs,
        collectinfo = summary.pre_process.collectinfo,
        duplicates = summary.pre_process.duplicates,
        failed = summary.pre_process.failed,
        "Ingest finished"
    );
    Ok(())
}
