use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::features::row::FeatureKey;
use crate::processor::job::{RowState, SkipReason};

/// Keys of failed rows kept for the summary. The rest are only counted.
pub const MAX_REPORTED_FAILURES: usize = 50;

/// Outcome of one symbol within a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolReport {
    pub rows_processed: usize,
    pub rows_written: usize,
    pub rows_dry_run: usize,
    pub rows_skipped_insufficient: usize,
    pub rows_already_committed: usize,
    pub rows_failed: usize,
    pub failed_keys: Vec<(FeatureKey, String)>,
    pub upstream_rejected: usize,
    /// Skipped entirely because a checkpoint marks it completed.
    pub skipped: bool,
    /// The upstream collector could not gap-fill this symbol.
    pub degraded: bool,
    /// Reads or writes failed beyond retry.
    pub failed: bool,
    pub interrupted: bool,
}

impl SymbolReport {
    /// Count a row that reached a terminal state.
    pub fn record_row(&mut self, key: &FeatureKey, state: RowState) {
        match state {
            RowState::Committed => self.rows_written += 1,
            RowState::Skipped(SkipReason::InsufficientData) => self.rows_skipped_insufficient += 1,
            RowState::Skipped(SkipReason::AlreadyCommitted) => self.rows_already_committed += 1,
            RowState::Failed(error) => self.record_failure(key.clone(), error),
            RowState::Pending | RowState::Processing => {}
        }
    }

    pub fn record_failure(&mut self, key: FeatureKey, error: String) {
        self.rows_failed += 1;
        if self.failed_keys.len() < MAX_REPORTED_FAILURES {
            self.failed_keys.push((key, error));
        }
    }
}

/// Totals for a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillStats {
    pub rows_processed: usize,
    pub rows_written: usize,
    pub rows_dry_run: usize,
    pub rows_skipped_insufficient: usize,
    pub rows_already_committed: usize,
    pub rows_failed: usize,
    pub failed_keys: Vec<(FeatureKey, String)>,
    pub upstream_rejected: usize,
    pub symbols_completed: usize,
    pub symbols_skipped: usize,
    pub symbols_failed: usize,
    pub symbols_degraded: usize,
    pub interrupted: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BackfillStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, report: SymbolReport) {
        self.rows_processed += report.rows_processed;
        self.rows_written += report.rows_written;
        self.rows_dry_run += report.rows_dry_run;
        self.rows_skipped_insufficient += report.rows_skipped_insufficient;
        self.rows_already_committed += report.rows_already_committed;
        self.rows_failed += report.rows_failed;
        self.upstream_rejected += report.upstream_rejected;

        let room = MAX_REPORTED_FAILURES.saturating_sub(self.failed_keys.len());
        self.failed_keys.extend(report.failed_keys.into_iter().take(room));

        if report.degraded {
            self.symbols_degraded += 1;
        }
        if report.interrupted {
            self.interrupted = true;
        }

        if report.skipped {
            self.symbols_skipped += 1;
        } else if report.failed || report.rows_failed > 0 {
            self.symbols_failed += 1;
        } else if !report.interrupted {
            self.symbols_completed += 1;
        }
    }

    /// A symbol task that panicked or was cancelled.
    pub fn record_lost_symbol(&mut self) {
        self.symbols_failed += 1;
    }

    pub fn has_failures(&self) -> bool {
        self.rows_failed > 0 || self.symbols_failed > 0
    }

    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            rows_processed = self.rows_processed,
            rows_written = self.rows_written,
            rows_dry_run = self.rows_dry_run,
            rows_skipped_insufficient = self.rows_skipped_insufficient,
            rows_already_committed = self.rows_already_committed,
            rows_failed = self.rows_failed,
            upstream_rejected = self.upstream_rejected,
            symbols_completed = self.symbols_completed,
            symbols_skipped = self.symbols_skipped,
            symbols_failed = self.symbols_failed,
            symbols_degraded = self.symbols_degraded,
            interrupted = self.interrupted,
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "Materialization finished"
        );

        for (key, error) in &self.failed_keys {
            tracing::warn!(key = %key, error = %error, "Row failed");
        }
        if self.rows_failed > self.failed_keys.len() {
            tracing::warn!(
                "{} more failed rows not listed",
                self.rows_failed - self.failed_keys.len()
            );
        }
    }
}
