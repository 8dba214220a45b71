use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::checkpoint::run_key;
use crate::error::{FeatureError, Result};
use crate::features::symbol::Symbol;
use crate::utils::utils::hour_floor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Backfill,
    Refresh,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backfill => write!(f, "backfill"),
            JobKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// One materialization run over `[start, end)`, both aligned to the hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillJob {
    pub kind: JobKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// `None` means every symbol in the price table.
    pub symbols: Option<Vec<Symbol>>,
    pub resume: bool,
}

impl BackfillJob {
    pub fn backfill(start: DateTime<Utc>, end: DateTime<Utc>, symbols: Option<Vec<Symbol>>, resume: bool) -> Result<Self> {
        let start = hour_floor(start);
        let end = hour_floor(end);
        if end <= start {
            return Err(FeatureError::Config(format!(
                "backfill range is empty: start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self {
            kind: JobKind::Backfill,
            start,
            end,
            symbols,
            resume,
        })
    }

    /// The trailing `hours` hours, including the current partial hour.
    pub fn refresh(now: DateTime<Utc>, hours: u32, symbols: Option<Vec<Symbol>>) -> Self {
        let end = hour_floor(now) + Duration::hours(1);
        Self {
            kind: JobKind::Refresh,
            start: end - Duration::hours(hours.max(1) as i64),
            end,
            symbols,
            resume: false,
        }
    }

    /// Refreshes recompute recent hours on every pass and keep no checkpoints.
    pub fn uses_checkpoints(&self) -> bool {
        self.kind == JobKind::Backfill
    }

    pub fn run_key(&self) -> String {
        run_key(self.start, self.end)
    }

    pub fn hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    InsufficientData,
    AlreadyCommitted,
}

/// Lifecycle of one `(symbol, hour)` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowState {
    Pending,
    Processing,
    Committed,
    Skipped(SkipReason),
    Failed(String),
}

impl RowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RowState::Committed | RowState::Skipped(_) | RowState::Failed(_))
    }

    /// Move to `next`, rejecting transitions the driver never makes.
    pub fn advance(self, next: RowState) -> Result<RowState> {
        let allowed = match (&self, &next) {
            (RowState::Pending, RowState::Processing) => true,
            (RowState::Pending, RowState::Skipped(SkipReason::AlreadyCommitted)) => true,
            (RowState::Processing, RowState::Committed)
            | (RowState::Processing, RowState::Skipped(_))
            | (RowState::Processing, RowState::Failed(_)) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(FeatureError::InvalidState(format!("row transition {:?} -> {:?}", self, next)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backfill_aligns_to_hours() {
        let job = BackfillJob::backfill(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            None,
            false,
        )
        .unwrap();
        assert_eq!(job.start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(job.hours(), 24);
        assert!(job.uses_checkpoints());
    }

    #[test]
    fn test_empty_range_rejected() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(BackfillJob::backfill(t, t, None, false), Err(FeatureError::Config(_))));
    }

    #[test]
    fn test_refresh_window_includes_current_hour() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 10, 42, 0).unwrap();
        let job = BackfillJob::refresh(now, 24, None);
        assert_eq!(job.end, Utc.with_ymd_and_hms(2024, 3, 15, 11, 0, 0).unwrap());
        assert_eq!(job.hours(), 24);
        assert!(!job.uses_checkpoints());
    }

    #[test]
    fn test_row_state_machine() {
        let state = RowState::Pending.advance(RowState::Processing).unwrap();
        let state = state.advance(RowState::Committed).unwrap();
        assert!(state.is_terminal());
        assert!(state.advance(RowState::Processing).is_err());
        assert!(RowState::Pending.advance(RowState::Committed).is_err());
    }
}
