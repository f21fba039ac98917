//! tidemark - incremental keyset extraction
//!
//! # Usage
//!
//! ```bash
//! # Run the configured job
//! tidemark -c job.yaml
//!
//! # Validate configuration
//! tidemark -c job.yaml validate
//!
//! # Show the key columns the job would use
//! tidemark -c job.yaml keys
//!
//! # Show the next query for the stored watermark
//! tidemark -c job.yaml plan
//!
//! # Show the stored watermark
//! tidemark -c job.yaml watermark
//! ```
//!
//! Exit codes: 0 when the job completed, 3 when a one-shot job stopped on a
//! batch that did not advance the watermark, 1 on failure.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tidemark::config::{EmitterConfig, TidemarkConfig, WatermarkStoreConfig};
use tidemark::emitter::{Emitter, JsonLinesEmitter, StdoutEmitter};
use tidemark::engine::{Completion, Extractor};
use tidemark::key::resolve_keys;
use tidemark::planner::plan;
use tidemark::source::TableReader;
use tidemark::watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};

const EXIT_STALLED: u8 = 3;

#[derive(Parser)]
#[command(name = "tidemark")]
#[command(version, about = "Incremental, resumable keyset extraction from relational tables")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tidemark.yaml", env = "TIDEMARK_CONFIG")]
    config: std::path::PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the extraction job (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Resolve and print the key columns
    Keys,
    /// Print the query the next poll would run
    Plan,
    /// Print the stored watermark
    Watermark,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = TidemarkConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate_config(&config),
        Commands::Keys => show_keys(&config).await,
        Commands::Plan => show_plan(&config).await,
        Commands::Watermark => show_watermark(&config).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout is reserved for emitted rows
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(config: TidemarkConfig) -> Result<ExitCode> {
    info!(job = %config.job.identity(), mode = %config.job.mode, "Starting tidemark");

    let store = build_store(&config.watermark_store).await?;
    let emitter = build_emitter(&config.emitter);
    let reader = build_reader(&config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping after the current poll");
            signal.cancel();
        }
    });

    let result = Extractor::new(config.job_options(), reader, store, emitter)
        .with_shutdown(shutdown)
        .run()
        .await;

    match result {
        Ok(report) => {
            info!(
                completion = %report.completion,
                rows = report.stats.rows,
                batches = report.stats.batches,
                retries = report.stats.retries,
                watermark = %report
                    .watermark
                    .as_ref()
                    .map_or_else(|| "<none>".to_string(), ToString::to_string),
                "Job complete"
            );
            if report.completion == Completion::Stalled {
                Ok(ExitCode::from(EXIT_STALLED))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Err(failure) => {
            error!(
                state = %failure.state,
                kind = failure.error.kind(),
                "{}",
                failure
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

fn validate_config(config: &TidemarkConfig) -> Result<ExitCode> {
    println!("Configuration is valid");
    println!("  job:        {}", config.job.identity());
    println!("  table:      {}", config.job.table_ref());
    match &config.job.key_columns {
        Some(keys) => println!("  keys:       {}", keys.join(", ")),
        None => println!("  keys:       <primary key>"),
    }
    match config.job.limit() {
        Some(limit) => println!("  batch size: {}", limit),
        None => println!("  batch size: unbounded"),
    }
    println!("  mode:       {}", config.job.mode);
    Ok(ExitCode::SUCCESS)
}

async fn show_keys(config: &TidemarkConfig) -> Result<ExitCode> {
    let mut reader = build_reader(config)?;
    let table = config.job.table_ref();
    let keys = resolve_keys(reader.as_mut(), &table, config.job.key_columns.as_deref()).await;
    close_reader(reader.as_mut()).await;

    let keys = keys.with_context(|| format!("Failed to resolve keys for {}", table))?;
    if keys.is_empty() {
        println!("{}: no key columns (single-pass mode)", table);
    } else {
        println!("{}: {}", table, keys);
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_plan(config: &TidemarkConfig) -> Result<ExitCode> {
    let store = build_store(&config.watermark_store).await?;
    let mut reader = build_reader(config)?;
    let options = config.job_options();

    let keys = resolve_keys(reader.as_mut(), &options.table, options.key_columns.as_deref()).await;
    close_reader(reader.as_mut()).await;
    let keys = keys.with_context(|| format!("Failed to resolve keys for {}", options.table))?;

    let bound = match store.get(&options.job_id).await? {
        Some(watermark) if !keys.is_empty() => Some(watermark.tuple_for(&keys)?),
        _ => None,
    };
    let query = plan(
        &options.table,
        &options.columns,
        &keys,
        bound.as_ref(),
        options.limit,
        reader.dialect(),
    )?;

    println!("{}", query.sql);
    for (i, param) in query.params.iter().enumerate() {
        println!("  ${} = {:?}", i + 1, param);
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_watermark(config: &TidemarkConfig) -> Result<ExitCode> {
    let store = build_store(&config.watermark_store).await?;
    let job = config.job.identity();
    match store.get(&job).await? {
        Some(watermark) => println!("{}", serde_json::to_string_pretty(&watermark)?),
        None => println!("{}: no watermark stored", job),
    }
    Ok(ExitCode::SUCCESS)
}

async fn build_store(config: &WatermarkStoreConfig) -> Result<Arc<dyn WatermarkStore>> {
    match config {
        WatermarkStoreConfig::Memory => {
            warn!("Using in-memory watermark store; progress is lost when the process exits");
            Ok(Arc::new(MemoryWatermarkStore::new()))
        }
        WatermarkStoreConfig::File { dir } => {
            let store = FileWatermarkStore::open(dir)
                .await
                .with_context(|| format!("Failed to open watermark store {}", dir.display()))?;
            Ok(Arc::new(store))
        }
    }
}

fn build_emitter(config: &EmitterConfig) -> Arc<dyn Emitter> {
    match config {
        EmitterConfig::Stdout => Arc::new(StdoutEmitter::new()),
        EmitterConfig::Jsonl { dir } => Arc::new(JsonLinesEmitter::new(dir)),
    }
}

#[cfg(feature = "mysql")]
fn build_reader(config: &TidemarkConfig) -> Result<Box<dyn TableReader>> {
    use tidemark::source::RdbcReader;
    use tidemark_rdbc::dialect::MySqlDialect;
    use tidemark_rdbc::mysql::MySqlConnectionFactory;
    use tidemark_rdbc::schema::InformationSchemaProvider;

    let connection = config
        .job
        .connection
        .to_connection_config()
        .with_application_name("tidemark");
    Ok(Box::new(RdbcReader::new(
        Arc::new(MySqlConnectionFactory::new()),
        Box::new(InformationSchemaProvider::new(Box::new(MySqlDialect))),
        Box::new(MySqlDialect),
        connection,
    )))
}

#[cfg(not(feature = "mysql"))]
fn build_reader(_config: &TidemarkConfig) -> Result<Box<dyn TableReader>> {
    anyhow::bail!("tidemark was built without a database backend; enable the `mysql` feature")
}

async fn close_reader(reader: &mut dyn TableReader) {
    if let Err(e) = reader.close().await {
        warn!(error = %e, "Failed to close source connection");
    }
}
