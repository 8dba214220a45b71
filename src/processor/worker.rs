use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore};
use crate::config::BackfillSettings;
use crate::database::models::{HourlyBar, PriceObservation};
use crate::database::sources::SourceReader;
use crate::database::writer::FeatureSink;
use crate::error::Result;
use crate::features::aligner::{
    apply_price, resample_hourly, MacroSeries, OnchainByDate, SentimentByDate, UpstreamTechnicals,
};
use crate::features::row::{FeatureColumn, FeatureGroup, MaterializedFeatureRow};
use crate::features::symbol::Symbol;
use crate::indicators::calculator::IndicatorState;
use crate::processor::job::{BackfillJob, RowState, SkipReason};
use crate::processor::stats::{BackfillStats, SymbolReport};
use crate::upstream::collector::CollectorClient;

/// Hours of source data read per round-trip while walking a symbol's range.
pub const FETCH_WINDOW_HOURS: i64 = 24 * 7;

/// Observations read per lookback page while seeding the indicators.
const WARMUP_PAGE_ROWS: usize = 5_000;

// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub warmup_bars: usize,
    pub macro_max_staleness_days: i64,
    /// Compute and count only: no writes, no checkpoints, no collector calls.
    pub dry_run: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: num_cpus::get(),
            warmup_bars: 250,
            macro_max_staleness_days: 3,
            dry_run: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &BackfillSettings, dry_run: bool) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            concurrency: settings.concurrency.max(1),
            warmup_bars: settings.warmup_bars,
            macro_max_staleness_days: settings.macro_max_staleness_days,
            dry_run,
        }
    }
}

// Commit watermark of one symbol. Once a row fails the watermark stops
// moving, so a resumed run revisits the failed row.
#[derive(Debug, Clone, Default)]
struct Progress {
    watermark: Option<DateTime<Utc>>,
    rows_committed: u64,
    frozen: bool,
}

impl Progress {
    fn from_checkpoint(checkpoint: Option<&Checkpoint>) -> Self {
        Self {
            watermark: checkpoint.and_then(|c| c.last_committed),
            rows_committed: checkpoint.map_or(0, |c| c.rows_committed),
            frozen: false,
        }
    }

    fn committed(&mut self, bucket_start: DateTime<Utc>, rows: usize) {
        self.rows_committed += rows as u64;
        if !self.frozen {
            self.watermark = Some(bucket_start);
        }
    }

    fn covers(&self, bucket_start: DateTime<Utc>) -> bool {
        self.watermark.map_or(false, |w| bucket_start <= w)
    }
}

/// Drives a backfill or refresh: symbols in parallel, hours in order within a symbol.
#[derive(Clone)]
pub struct Worker {
    reader: Arc<dyn SourceReader>,
    sink: Arc<dyn FeatureSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    collector: Option<Arc<CollectorClient>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        reader: Arc<dyn SourceReader>,
        sink: Arc<dyn FeatureSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        collector: Option<Arc<CollectorClient>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            reader,
            sink,
            checkpoints,
            collector,
            config,
        }
    }

    /// Run `job` to completion or until `shutdown` flips to `true`.
    ///
    /// Only failures that make the whole run meaningless (listing symbols,
    /// reading macro data) are returned as errors. Per-symbol and per-row
    /// failures are logged and counted in the returned stats.
    #[instrument(skip(self, job, shutdown), fields(run_id = %Uuid::new_v4(), kind = %job.kind))]
    pub async fn run(&self, job: &BackfillJob, shutdown: watch::Receiver<bool>) -> Result<BackfillStats> {
        let started = Instant::now();

        let symbols = match &job.symbols {
            Some(symbols) => symbols.clone(),
            None => self.reader.symbols().await?,
        };

        info!(
            symbols = symbols.len(),
            start = %job.start,
            end = %job.end,
            hours = job.hours(),
            resume = job.resume,
            dry_run = self.config.dry_run,
            concurrency = self.config.concurrency,
            "Starting {}",
            job.kind
        );

        let macro_series = Arc::new(self.load_macro(job).await?);
        debug!(values = macro_series.len(), "Loaded macro indicators");

        // Set up channels
        let (symbol_tx, symbol_rx) = mpsc::channel(self.config.concurrency * 2);
        tokio::spawn(Self::symbol_producer(symbols, symbol_tx, shutdown.clone()));

        let mut stats = self
            .symbol_consumer(symbol_rx, Arc::new(job.clone()), macro_series, shutdown)
            .await;

        stats.elapsed = started.elapsed();
        stats.log_summary(&job.kind.to_string());
        Ok(stats)
    }

    async fn symbol_producer(symbols: Vec<Symbol>, symbol_tx: mpsc::Sender<Symbol>, shutdown: watch::Receiver<bool>) {
        for symbol in symbols {
            if *shutdown.borrow() {
                info!("Shutdown requested, no further symbols will be started");
                break;
            }
            if symbol_tx.send(symbol).await.is_err() {
                break;
            }
        }
    }

    async fn symbol_consumer(
        &self,
        mut symbol_rx: mpsc::Receiver<Symbol>,
        job: Arc<BackfillJob>,
        macro_series: Arc<MacroSeries>,
        shutdown: watch::Receiver<bool>,
    ) -> BackfillStats {
        // Create a semaphore to limit concurrent processing
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut stats = BackfillStats::new();

        while let Some(symbol) = symbol_rx.recv().await {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if *shutdown.borrow() {
                break;
            }

            let worker = self.clone();
            let job = Arc::clone(&job);
            let macro_series = Arc::clone(&macro_series);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.process_symbol(&symbol, &job, &macro_series, shutdown).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => stats.record(report),
                Err(e) => {
                    error!("Symbol task did not finish: {}", e);
                    stats.record_lost_symbol();
                }
            }
        }

        if *shutdown.borrow() {
            stats.interrupted = true;
        }
        stats
    }

    #[instrument(skip(self, symbol, job, macro_series, shutdown), fields(symbol = %symbol))]
    async fn process_symbol(
        &self,
        symbol: &Symbol,
        job: &BackfillJob,
        macro_series: &MacroSeries,
        shutdown: watch::Receiver<bool>,
    ) -> SymbolReport {
        let mut report = SymbolReport::default();
        let run_key = job.uses_checkpoints().then(|| job.run_key());

        let checkpoint = match (&run_key, job.resume) {
            (Some(key), true) => match self.checkpoints.load(key, symbol).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    error!(error = %e, "Failed to load checkpoint");
                    report.failed = true;
                    return report;
                }
            },
            _ => None,
        };

        if let Some(cp) = &checkpoint {
            if cp.status == CheckpointStatus::Completed {
                info!(rows_committed = cp.rows_committed, "Already completed in this run, skipping");
                report.skipped = true;
                return report;
            }
            info!(last_committed = ?cp.last_committed, "Resuming from checkpoint");
        }

        if let (Some(collector), false) = (&self.collector, self.config.dry_run) {
            if let Err(e) = collector.collect(symbol, job.start, job.end).await {
                warn!(error = %e, "Collector gap-fill failed, continuing with stored data");
                report.degraded = true;
            }
        }

        let mut progress = Progress::from_checkpoint(checkpoint.as_ref());
        let persist = run_key.as_deref().filter(|_| !self.config.dry_run);

        if let Err(e) = self
            .materialize(symbol, job, macro_series, persist, &mut progress, &mut report, &shutdown)
            .await
        {
            error!(error = %e, "Symbol failed");
            report.failed = true;
        }

        if let Some(key) = persist {
            let status = if report.failed || report.rows_failed > 0 {
                CheckpointStatus::Failed
            } else if report.interrupted {
                CheckpointStatus::Running
            } else {
                CheckpointStatus::Completed
            };
            self.save_checkpoint(key, symbol, &progress, status).await;
        }

        info!(
            rows_processed = report.rows_processed,
            rows_written = report.rows_written,
            rows_skipped_insufficient = report.rows_skipped_insufficient,
            rows_failed = report.rows_failed,
            "Symbol finished"
        );
        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize(
        &self,
        symbol: &Symbol,
        job: &BackfillJob,
        macro_series: &MacroSeries,
        run_key: Option<&str>,
        progress: &mut Progress,
        report: &mut SymbolReport,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut state = IndicatorState::new();
        for bar in self.load_warmup(symbol, job.start).await? {
            state.push(bar);
        }
        debug!(warmup_bars = state.bars_seen(), "Indicator state seeded");

        let mut batch: Vec<MaterializedFeatureRow> = Vec::with_capacity(self.config.batch_size);
        let mut window_start = job.start;

        'windows: while window_start < job.end {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            let window_end = (window_start + Duration::hours(FETCH_WINDOW_HOURS)).min(job.end);

            let observations = self.reader.price_observations(symbol, window_start, window_end).await?;
            if observations.is_empty() {
                debug!(from = %window_start, to = %window_end, "No price data in window");
                window_start = window_end;
                continue;
            }

            let first_day = window_start.date_naive();
            let last_day = (window_end - Duration::seconds(1)).date_naive();
            let technicals = UpstreamTechnicals::new(self.reader.technical_rows(symbol, window_start, window_end).await?);
            let onchain = OnchainByDate::new(self.reader.onchain_rows(symbol, first_day, last_day).await?);
            let sentiment = SentimentByDate::new(self.reader.sentiment_days(symbol, first_day, last_day).await?);

            for bar in resample_hourly(&observations) {
                report.rows_processed += 1;
                let mut row = MaterializedFeatureRow::new(symbol.clone(), bar.bucket_start);
                apply_price(&mut row, &bar);
                // Every bar feeds the recurrences, including already-committed ones
                state.push(bar);

                if progress.covers(row.bucket_start) {
                    let skipped = RowState::Pending.advance(RowState::Skipped(SkipReason::AlreadyCommitted))?;
                    report.record_row(&row.key, skipped);
                    continue;
                }
                let processing = RowState::Pending.advance(RowState::Processing)?;

                state.snapshot().apply_to(&mut row);
                report.upstream_rejected += technicals.fill_gaps(&mut row);

                if !row.has_group(FeatureGroup::Technical) {
                    match state.insufficient_history() {
                        Some(reason) => debug!(key = %row.key, %reason, "Row skipped"),
                        None => debug!(key = %row.key, "Row skipped, no technical value in range"),
                    }
                    report.record_row(&row.key, processing.advance(RowState::Skipped(SkipReason::InsufficientData))?);
                    continue;
                }

                macro_series.apply(&mut row);
                onchain.apply(&mut row);
                sentiment.apply(&mut row);
                batch.push(row);

                if batch.len() >= self.config.batch_size {
                    self.flush(symbol, run_key, &mut batch, progress, report).await;
                    if *shutdown.borrow() {
                        report.interrupted = true;
                        break 'windows;
                    }
                }
            }

            window_start = window_end;
        }

        // The in-flight batch commits even when shutting down
        self.flush(symbol, run_key, &mut batch, progress, report).await;
        Ok(())
    }

    async fn flush(
        &self,
        symbol: &Symbol,
        run_key: Option<&str>,
        batch: &mut Vec<MaterializedFeatureRow>,
        progress: &mut Progress,
        report: &mut SymbolReport,
    ) {
        if batch.is_empty() {
            return;
        }
        let rows = std::mem::replace(batch, Vec::with_capacity(self.config.batch_size));

        if self.config.dry_run {
            report.rows_dry_run += rows.len();
            debug!(rows = rows.len(), "Dry run, batch not written");
            return;
        }

        match self.sink.upsert_batch(&rows).await {
            Ok(_) => {
                for row in &rows {
                    report.record_row(&row.key, RowState::Committed);
                }
                if let Some(last) = rows.last() {
                    progress.committed(last.bucket_start, rows.len());
                }
            }
            Err(e) => {
                warn!(error = %e, rows = rows.len(), "Batch failed, retrying rows individually");
                for row in &rows {
                    match self.sink.upsert_batch(std::slice::from_ref(row)).await {
                        Ok(_) => {
                            report.record_row(&row.key, RowState::Committed);
                            progress.committed(row.bucket_start, 1);
                        }
                        Err(e) => {
                            error!(key = %row.key, error = %e, "Row failed");
                            report.record_row(&row.key, RowState::Failed(e.to_string()));
                            progress.frozen = true;
                        }
                    }
                }
            }
        }

        if let Some(key) = run_key {
            self.save_checkpoint(key, symbol, progress, CheckpointStatus::Running).await;
        }
    }

    async fn save_checkpoint(&self, run_key: &str, symbol: &Symbol, progress: &Progress, status: CheckpointStatus) {
        let checkpoint =
            Checkpoint::running(symbol.clone(), progress.watermark, progress.rows_committed).with_status(status);
        // Losing a checkpoint only costs recomputation; upserts are idempotent
        if let Err(e) = self.checkpoints.save(run_key, &checkpoint).await {
            warn!(error = %e, status = %status, "Failed to save checkpoint");
        }
    }

    /// Hourly bars before `start` used to seed the indicator state.
    ///
    /// Pages backwards until `warmup_bars` complete hours are loaded or the
    /// history runs out, whatever the sampling rate of the price table.
    async fn load_warmup(&self, symbol: &Symbol, start: DateTime<Utc>) -> Result<Vec<HourlyBar>> {
        let target = self.config.warmup_bars;
        if target == 0 {
            return Ok(Vec::new());
        }

        let page_rows = WARMUP_PAGE_ROWS.max(target);
        let mut observations: Vec<PriceObservation> = Vec::new();
        let mut before = start;
        let mut exhausted = false;
        let mut pages = 0usize;

        // One bar beyond the target, the oldest one may be cut by the page boundary
        while !exhausted && resample_hourly(&observations).len() <= target {
            let mut page = self.reader.price_history_before(symbol, before, page_rows).await?;
            pages += 1;
            exhausted = page.len() < page_rows;
            let Some(first) = page.first() else {
                break;
            };
            before = first.time();
            page.append(&mut observations);
            observations = page;
        }

        let mut bars = resample_hourly(&observations);
        if !exhausted && bars.len() > 1 {
            bars.remove(0);
        }
        debug!(%symbol, pages, observations = observations.len(), bars = bars.len(), "Warmup loaded");
        Ok(bars)
    }

    async fn load_macro(&self, job: &BackfillJob) -> Result<MacroSeries> {
        let names: Vec<&str> = FeatureColumn::macro_columns()
            .filter_map(|c| c.macro_indicator_name())
            .collect();
        let staleness = self.config.macro_max_staleness_days;
        let from = job.start.date_naive() - Duration::days(staleness);
        let to = (job.end - Duration::seconds(1)).date_naive();

        let rows = self.reader.macro_rows(&names, from, to).await?;
        Ok(MacroSeries::new(rows, staleness))
    }
}
