//! Command line interface.
//!
//! ```text
//! honeycomb [-c config.yaml] bulk <SOURCES>... [--db PATH] [--batch-size N] [--status PATH]
//! honeycomb [-c config.yaml] delta <SOURCE> [--db PATH] [--status PATH] [--follow] [--reset-checkpoint]
//! honeycomb [-c config.yaml] dlq list [--db PATH]
//! honeycomb [-c config.yaml] dlq repair [--db PATH] [--max-retries N]
//! ```
//!
//! Exit codes: 0 on success, 2 when the run completed but quarantined
//! records, 1 on a fatal error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use honeycomb_core::{cancel_on_signal, init_metrics};

use crate::config::Config;
use crate::dlq::DeadLetterQueue;
use crate::error::{PipelineError, TaskJoinSnafu};
use crate::pipeline::{BulkLoader, DeltaLoader, DeltaOptions, LoaderContext, Stats};
use crate::status::{StatusHandle, StatusReporter};
use crate::store::{SqliteStore, StoreRef};

/// Exit code for a run that finished but quarantined records.
pub const EXIT_QUARANTINED: u8 = 2;

#[derive(Parser, Debug)]
#[command(version, about = "Load honeypot session logs into SQLite")]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Backfill complete log files
    Bulk(BulkArgs),
    /// Ingest what was appended to one log since the last run
    Delta(DeltaArgs),
    /// Inspect or repair quarantined records
    #[command(subcommand)]
    Dlq(DlqCommand),
}

/// Storage target shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct StorageArgs {
    /// SQLite database to write to
    #[arg(long)]
    pub db: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BulkArgs {
    /// Files, directories or patterns such as `logs/cowrie.json.*`
    #[arg(required = true)]
    pub sources: Vec<PathBuf>,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Records per committed batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Where to write the status document
    #[arg(long)]
    pub status: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DeltaArgs {
    /// The log file to follow
    pub source: PathBuf,

    #[command(flatten)]
    pub storage: StorageArgs,

    /// Where to write the status document
    #[arg(long)]
    pub status: Option<PathBuf>,

    /// Records per committed batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Keep polling the source until interrupted
    #[arg(long)]
    pub follow: bool,

    /// Discard the stored checkpoint and read from the start
    #[arg(long)]
    pub reset_checkpoint: bool,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// Print pending entries as JSON lines
    ///
    /// Reloading a source that still contains the same bad record counts
    /// as an attempt, so `retry_count` can reach the cap without `repair`.
    List(StorageArgs),
    /// Repair and replay pending entries
    Repair(RepairArgs),
}

#[derive(Args, Debug)]
pub struct RepairArgs {
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Attempts before an entry is discarded
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl Cli {
    /// Load the configuration and apply flags shared by all subcommands.
    pub fn load_config(&self) -> Result<Config, PipelineError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let (storage, batch_size, status) = match &self.command {
            Command::Bulk(args) => (&args.storage, args.batch_size, args.status.as_ref()),
            Command::Delta(args) => (&args.storage, args.batch_size, args.status.as_ref()),
            Command::Dlq(DlqCommand::List(storage)) => (storage, None, None),
            Command::Dlq(DlqCommand::Repair(args)) => (&args.storage, None, None),
        };
        if let Some(db) = &storage.db {
            config.storage.path = db.clone();
        }
        if let Some(path) = status {
            config.status.path = Some(path.clone());
        }
        if let Command::Dlq(DlqCommand::Repair(RepairArgs {
            max_retries: Some(max),
            ..
        })) = &self.command
        {
            config.dlq.max_retries = *max;
        }
        Ok(config.with_batch_size(batch_size)?)
    }

    /// Run the selected subcommand to completion.
    pub async fn run(self) -> ExitCode {
        let config = match self.load_config() {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                return ExitCode::FAILURE;
            }
        };

        if let Some(address) = &config.metrics.address {
            if let Err(e) = init_metrics(address) {
                eprintln!("Failed to start metrics server: {e}");
                return ExitCode::FAILURE;
            }
        }

        let store = match open_store(&config).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Failed to open storage: {e}");
                return ExitCode::FAILURE;
            }
        };

        match self.command {
            Command::Bulk(args) => {
                let batch_size = config.ingest.batch_size;
                run_loader("bulk", store, config, |ctx| async move {
                    BulkLoader::new(ctx).load(&args.sources, batch_size).await
                })
                .await
            }
            Command::Delta(args) => {
                let options = DeltaOptions {
                    batch_size: config.ingest.batch_size,
                    reset_checkpoint: args.reset_checkpoint,
                };
                run_loader("delta", store, config, |ctx| async move {
                    let loader = DeltaLoader::new(ctx);
                    if args.follow {
                        loader.follow(&args.source, &options).await
                    } else {
                        loader.load_incremental(&args.source, &options).await
                    }
                })
                .await
            }
            Command::Dlq(DlqCommand::List(_)) => finish_dlq(dlq_list(store, config).await),
            Command::Dlq(DlqCommand::Repair(_)) => finish_dlq(dlq_repair(store, config).await),
        }
    }
}

async fn open_store(config: &Config) -> Result<StoreRef, PipelineError> {
    let path = config.storage.path.clone();
    let busy_timeout = Duration::from_millis(config.storage.busy_timeout_ms);
    let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path, busy_timeout))
        .await
        .context(TaskJoinSnafu)??;
    Ok(Arc::new(store))
}

/// Run a loader with signal handling and status reporting around it.
async fn run_loader<F, Fut>(mode: &str, store: StoreRef, config: Config, load: F) -> ExitCode
where
    F: FnOnce(LoaderContext) -> Fut,
    Fut: Future<Output = Result<Stats, PipelineError>>,
{
    let shutdown = CancellationToken::new();
    let signals = cancel_on_signal(shutdown.clone());

    let status = StatusHandle::new(mode);
    let reporter_stop = CancellationToken::new();
    let reporter = StatusReporter::new(
        status.clone(),
        config.status.path.clone(),
        Duration::from_secs(config.status.interval_secs),
    )
    .spawn(reporter_stop.clone());

    info!(
        mode,
        db = %config.storage.path.display(),
        batch_size = config.ingest.batch_size,
        "Starting honeycomb loader"
    );
    let ctx = LoaderContext::new(store, config, status.clone(), shutdown.clone());
    let result = load(ctx).await;

    status.finish(result.as_ref().err());
    reporter_stop.cancel();
    if let Err(e) = reporter.await {
        error!(error = %e, "Status reporter panicked");
    }
    shutdown.cancel();
    let _ = signals.await;

    exit_code(&result)
}

/// Map a loader result to the process exit code.
pub fn exit_code(result: &Result<Stats, PipelineError>) -> ExitCode {
    match result {
        Ok(stats) if stats.quarantined > 0 => {
            info!(quarantined = stats.quarantined, "Completed with quarantined records");
            ExitCode::from(EXIT_QUARANTINED)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, class = ?e.class(), "Load failed");
            eprintln!("Load failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dead_letter_queue(store: StoreRef, config: Config) -> DeadLetterQueue {
    LoaderContext::new(store, config, StatusHandle::new("dlq"), CancellationToken::new())
        .dead_letter_queue()
}

async fn dlq_list(store: StoreRef, config: Config) -> Result<(), PipelineError> {
    let entries = dead_letter_queue(store, config).list_pending().await?;
    for entry in &entries {
        match serde_json::to_string(entry) {
            Ok(line) => println!("{line}"),
            Err(e) => error!(id = entry.id, error = %e, "Failed to serialize dead letter"),
        }
    }
    info!(pending = entries.len(), "Listed dead letters");
    Ok(())
}

async fn dlq_repair(store: StoreRef, config: Config) -> Result<(), PipelineError> {
    let summary = dead_letter_queue(store, config).repair_pending().await?;
    match serde_json::to_string(&summary) {
        Ok(line) => println!("{line}"),
        Err(e) => error!(error = %e, "Failed to serialize repair summary"),
    }
    Ok(())
}

fn finish_dlq(result: Result<(), PipelineError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Dead letter command failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bulk() {
        let cli = Cli::parse_from([
            "honeycomb",
            "bulk",
            "a.json",
            "logs/cowrie.json.*",
            "--db",
            "out.db",
            "--batch-size",
            "64",
        ]);
        let Command::Bulk(args) = &cli.command else {
            panic!("expected bulk");
        };
        assert_eq!(args.sources.len(), 2);

        let config = cli.load_config().unwrap();
        assert_eq!(config.storage.path, PathBuf::from("out.db"));
        assert_eq!(config.ingest.batch_size, 64);
        assert!(config.ingest.min_batch_size <= 64);
    }

    #[test]
    fn test_parse_delta_flags() {
        let cli = Cli::parse_from([
            "honeycomb",
            "delta",
            "cowrie.json",
            "--status",
            "status.json",
            "--follow",
            "--reset-checkpoint",
        ]);
        let Command::Delta(args) = &cli.command else {
            panic!("expected delta");
        };
        assert!(args.follow);
        assert!(args.reset_checkpoint);
        let config = cli.load_config().unwrap();
        assert_eq!(config.status.path, Some(PathBuf::from("status.json")));
    }

    #[test]
    fn test_parse_dlq_repair() {
        let cli = Cli::parse_from(["honeycomb", "dlq", "repair", "--max-retries", "7"]);
        assert_eq!(cli.load_config().unwrap().dlq.max_retries, 7);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let cli = Cli::parse_from(["honeycomb", "bulk", "a.json", "--batch-size", "0"]);
        assert!(matches!(cli.load_config(), Err(PipelineError::Config { .. })));
    }

    #[test]
    fn test_exit_codes() {
        let clean = Stats::default();
        assert_eq!(exit_code(&Ok(clean)), ExitCode::SUCCESS);

        let quarantined = Stats {
            quarantined: 1,
            ..Stats::default()
        };
        assert_eq!(exit_code(&Ok(quarantined)), ExitCode::from(EXIT_QUARANTINED));

        let fatal = Err(PipelineError::MaxQuarantined { count: 3 });
        assert_eq!(exit_code(&fatal), ExitCode::FAILURE);
    }
}
