// src/cli.rs
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cache::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::cache::redis::{RedisCheckpointStore, RedisManager};
use crate::config::Settings;
use crate::database::audit::coverage;
use crate::database::mysql::MySqlManager;
use crate::database::schema::verify_schema;
use crate::database::sources::MySqlSourceReader;
use crate::database::writer::MySqlFeatureWriter;
use crate::features::symbol::Symbol;
use crate::processor::job::BackfillJob;
use crate::processor::stats::BackfillStats;
use crate::processor::worker::{Worker, WorkerConfig};
use crate::upstream::collector::CollectorClient;
use crate::utils::utils::{format_time, measure_time, parse_timestamp};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_PARTIAL: i32 = 2;

#[derive(Parser)]
#[command(name = "feature-materializer")]
#[command(about = "Refresh and backfill the ml_features_materialized table", long_about = None)]
pub struct Cli {
    /// Compute and count rows without writing anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Settings file (defaults to ./materializer.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Materialize every hour in [start, end)
    Backfill {
        /// Range start (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Range end, exclusive
        #[arg(long)]
        end: String,

        /// Comma-separated symbols (default: all symbols with price data)
        #[arg(long)]
        symbols: Option<String>,

        /// Skip hours already committed by an earlier run over the same range
        #[arg(long)]
        resume: bool,

        /// Symbols processed at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Recompute the trailing hours
    Refresh {
        #[arg(long, default_value = "24")]
        hours: u32,

        #[arg(long)]
        symbols: Option<String>,

        /// Keep refreshing until interrupted
        #[arg(long)]
        watch: bool,

        #[arg(long, default_value = "60")]
        interval_minutes: u64,
    },

    /// Check the live database against the expected schema
    VerifySchema,

    /// Per-column coverage of the materialized table over [start, end)
    Audit {
        /// Range start (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// Range end, exclusive
        #[arg(long)]
        end: String,
    },

    /// Show checkpoint state of a backfill range
    Checkpoints {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },

    /// Forget checkpoint state of a backfill range
    ClearCheckpoints {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,
    },
}

/// Parse a comma-separated symbol list into normalized, de-duplicated symbols.
pub fn parse_symbols(raw: Option<&str>) -> Result<Option<Vec<Symbol>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let symbols: BTreeSet<Symbol> = raw.split(',').filter_map(Symbol::normalize).collect();
    if symbols.is_empty() {
        anyhow::bail!("--symbols was given but contains no symbols");
    }
    Ok(Some(symbols.into_iter().collect()))
}

/// 0 when everything succeeded, 2 when the run finished with failed rows or symbols.
pub fn exit_code(stats: &BackfillStats) -> i32 {
    if stats.has_failures() || stats.interrupted {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}

async fn connect(settings: &Settings) -> Result<Arc<MySqlManager>> {
    let db = MySqlManager::new(&settings.database, settings.retry.clone())
        .await
        .context("Failed to connect to MySQL")?;
    Ok(Arc::new(db))
}

async fn checkpoint_store(settings: &Settings) -> Result<Arc<dyn CheckpointStore>> {
    match &settings.redis {
        Some(redis) => {
            let manager = RedisManager::new(&redis.url, redis.checkpoint_ttl_secs)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(RedisCheckpointStore::new(manager)))
        }
        None => {
            warn!("REDIS_URL not set, checkpoints are kept in memory and lost on exit");
            Ok(Arc::new(MemoryCheckpointStore::new()))
        }
    }
}

fn build_worker(
    settings: &Settings,
    db: &Arc<MySqlManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: WorkerConfig,
) -> Result<Worker> {
    let collector = match &settings.collector {
        Some(c) => Some(Arc::new(CollectorClient::new(&c.url, c.timeout, settings.retry.clone())?)),
        None => None,
    };

    Ok(Worker::new(
        Arc::new(MySqlSourceReader::new(Arc::clone(db), settings.database.price_table)),
        Arc::new(MySqlFeatureWriter::new(Arc::clone(db))),
        checkpoints,
        collector,
        config,
    ))
}

// Flips to true on the first Ctrl-C. In-flight batches still commit.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing in-flight batches");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Calendar days touched by the hours in `[start, end)`, as an inclusive date range.
fn audit_dates(start: &str, end: &str) -> Result<(NaiveDate, NaiveDate)> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    if end <= start {
        anyhow::bail!("audit range is empty: {} is not before {}", format_time(&start), format_time(&end));
    }
    Ok((start.date_naive(), (end - chrono::Duration::seconds(1)).date_naive()))
}

fn range_job(start: &str, end: &str) -> Result<BackfillJob> {
    let start = parse_timestamp(start)?;
    let end = parse_timestamp(end)?;
    Ok(BackfillJob::backfill(start, end, None, false)?)
}

/// Execute a command from the CLI and return the process exit code.
pub async fn execute_command(cli: Cli) -> Result<i32> {
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    info!(database = ?settings.database, backfill = ?settings.backfill, "Settings loaded");

    match cli.command {
        Commands::Backfill {
            start,
            end,
            symbols,
            resume,
            concurrency,
        } => {
            let start = parse_timestamp(&start)?;
            let end = parse_timestamp(&end)?;
            let job = BackfillJob::backfill(start, end, parse_symbols(symbols.as_deref())?, resume)?;

            let db = connect(&settings).await?;
            verify_schema(&db, settings.database.price_table).await?;

            let mut config = WorkerConfig::from_settings(&settings.backfill, cli.dry_run);
            if let Some(n) = concurrency {
                config.concurrency = n.max(1);
            }
            let worker = build_worker(&settings, &db, checkpoint_store(&settings).await?, config)?;

            let stats = worker.run(&job, shutdown_signal()).await?;
            db.close().await;
            Ok(exit_code(&stats))
        }

        Commands::Refresh {
            hours,
            symbols,
            watch,
            interval_minutes,
        } => {
            let symbols = parse_symbols(symbols.as_deref())?;
            let db = connect(&settings).await?;
            verify_schema(&db, settings.database.price_table).await?;

            // Refreshes keep no checkpoints
            let config = WorkerConfig::from_settings(&settings.backfill, cli.dry_run);
            let worker = build_worker(&settings, &db, Arc::new(MemoryCheckpointStore::new()), config)?;

            let mut shutdown = shutdown_signal();
            let interval = Duration::from_secs(interval_minutes.max(1) * 60);
            let mut code = EXIT_OK;

            loop {
                let job = BackfillJob::refresh(Utc::now(), hours, symbols.clone());
                match worker.run(&job, shutdown.clone()).await {
                    Ok(stats) => code = code.max(exit_code(&stats)),
                    Err(e) if watch => {
                        error!(error = %e, "Refresh pass failed, retrying next interval");
                        code = EXIT_PARTIAL;
                    }
                    Err(e) => return Err(e.into()),
                }

                if !watch || *shutdown.borrow() {
                    break;
                }
                info!("Next refresh in {} minutes", interval_minutes.max(1));
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }

            db.close().await;
            Ok(code)
        }

        Commands::VerifySchema => {
            let db = connect(&settings).await?;
            measure_time("schema verification", verify_schema(&db, settings.database.price_table)).await?;
            println!("Schema OK ({} as price source)", settings.database.price_table);
            db.close().await;
            Ok(EXIT_OK)
        }

        Commands::Audit { start, end } => {
            let (from, to) = audit_dates(&start, &end)?;
            let db = connect(&settings).await?;
            let report = coverage(&db, from, to).await?;
            report.print();
            db.close().await;
            Ok(EXIT_OK)
        }

        Commands::Checkpoints { start, end } => {
            let run_key = range_job(&start, &end)?.run_key();
            let store = checkpoint_store(&settings).await?;
            let mut checkpoints = store.list(&run_key).await?;
            checkpoints.sort_by(|a, b| a.symbol.cmp(&b.symbol));

            println!("Found {} checkpoints for {}:", checkpoints.len(), run_key);
            println!("{:<10} | {:<10} | {:<23} | {:>10} | {:<23}", "Symbol", "Status", "Last committed", "Rows", "Updated");
            println!("{:-<10}-+-{:-<10}-+-{:-<23}-+-{:-<10}-+-{:-<23}", "", "", "", "", "");
            for cp in checkpoints {
                println!(
                    "{:<10} | {:<10} | {:<23} | {:>10} | {:<23}",
                    cp.symbol,
                    cp.status,
                    cp.last_committed.as_ref().map(format_time).unwrap_or_else(|| "-".to_string()),
                    cp.rows_committed,
                    format_time(&cp.updated_at),
                );
            }
            Ok(EXIT_OK)
        }

        Commands::ClearCheckpoints { start, end } => {
            let run_key = range_job(&start, &end)?.run_key();
            let store = checkpoint_store(&settings).await?;
            if cli.dry_run {
                let count = store.list(&run_key).await?.len();
                println!("Would remove {} checkpoints for {}", count, run_key);
            } else {
                let removed = store.clear(&run_key).await?;
                println!("Removed {} checkpoints for {}", removed, run_key);
            }
            Ok(EXIT_OK)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols_normalizes_and_dedupes() {
        let symbols = parse_symbols(Some(" btc,BTCUSDT, eth ,,")).unwrap().unwrap();
        let names: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["BTC", "ETH"]);
    }

    #[test]
    fn test_parse_symbols_rejects_empty_list() {
        assert!(parse_symbols(Some(" , ")).is_err());
        assert!(parse_symbols(None).unwrap().is_none());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&BackfillStats::new()), EXIT_OK);

        let mut stats = BackfillStats::new();
        stats.rows_failed = 1;
        assert_eq!(exit_code(&stats), EXIT_PARTIAL);

        let mut stats = BackfillStats::new();
        stats.interrupted = true;
        assert_eq!(exit_code(&stats), EXIT_PARTIAL);
    }

    #[test]
    fn test_audit_end_is_exclusive_like_backfill() {
        let (from, to) = audit_dates("2024-01-01", "2024-02-01").unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());

        // A range ending mid-day still covers that day's earlier hours
        let (_, to) = audit_dates("2024-01-01", "2024-01-05T12:00:00Z").unwrap();
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        let (from, to) = audit_dates("2024-01-01", "2024-01-02").unwrap();
        assert_eq!(from, to);

        assert!(audit_dates("2024-01-02", "2024-01-02").is_err());
    }

    #[test]
    fn test_cli_parses_backfill() {
        let cli = Cli::try_parse_from([
            "feature-materializer",
            "--dry-run",
            "backfill",
            "--start",
            "2024-01-01",
            "--end",
            "2024-02-01",
            "--symbols",
            "BTC,ETH",
            "--resume",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert!(matches!(cli.command, Commands::Backfill { resume: true, .. }));
    }
}
