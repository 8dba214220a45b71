//! Key alignment between a target `(symbol, hour)` and the source rows that
//! feed it.
//!
//! Price observations are resampled to hourly bars. A feature row describes
//! the state at the END of its hour bucket, so its lookback window is every
//! bar up to and including its own. Macro values join on the calendar date
//! with a bounded staleness fallback; on-chain and sentiment values join on
//! the exact date only.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::database::models::{
    HourlyBar, MacroIndicatorRow, OnchainMetricRow, PriceObservation, SentimentDay, TechnicalIndicatorRow,
};
use crate::features::row::{FeatureColumn, MaterializedFeatureRow};
use crate::utils::utils::hour_floor;

/// Resample ascending observations into hourly OHLCV bars.
pub fn resample_hourly(observations: &[PriceObservation]) -> Vec<HourlyBar> {
    let mut bars: Vec<HourlyBar> = Vec::new();

    for obs in observations {
        let bucket = hour_floor(obs.time());
        let close = obs.close;
        let high = obs.high.unwrap_or(close).max(close);
        let low = obs.low.unwrap_or(close).min(close);

        match bars.last_mut() {
            Some(bar) if bar.bucket_start == bucket => {
                bar.high = bar.high.max(high);
                bar.low = bar.low.min(low);
                bar.close = close;
                bar.volume = match (bar.volume, obs.volume) {
                    (Some(a), Some(b)) => Some(a + b),
                    _ => None,
                };
            }
            Some(bar) if bar.bucket_start > bucket => {
                debug!("Out-of-order observation at {} ignored", obs.timestamp);
            }
            _ => bars.push(HourlyBar {
                bucket_start: bucket,
                open: obs.open.unwrap_or(close),
                high,
                low,
                close,
                volume: obs.volume,
            }),
        }
    }

    bars
}

/// Copy the bar's own price fields into the row.
pub fn apply_price(row: &mut MaterializedFeatureRow, bar: &HourlyBar) {
    row.set(FeatureColumn::CurrentPrice, Some(bar.close));
    row.set(FeatureColumn::OpenPrice, Some(bar.open));
    row.set(FeatureColumn::HighPrice, Some(bar.high));
    row.set(FeatureColumn::LowPrice, Some(bar.low));
    row.set(FeatureColumn::Volume, bar.volume);
}

/// Bounded-staleness macro resolution.
///
/// `candidate` is the most recent `(date, value)` at or before `target`.
/// An exact date match always wins; an older row is accepted only if it is
/// at most `max_staleness_days` old.
pub fn resolve_macro(target: NaiveDate, candidate: Option<(NaiveDate, f64)>, max_staleness_days: i64) -> Option<f64> {
    let (date, value) = candidate?;
    if date > target {
        return None;
    }
    let age = (target - date).num_days();
    if age <= max_staleness_days {
        Some(value)
    } else {
        None
    }
}

/// Macro indicator values by column and date, shared by every symbol of a run.
#[derive(Debug, Clone, Default)]
pub struct MacroSeries {
    series: HashMap<FeatureColumn, BTreeMap<NaiveDate, f64>>,
    max_staleness_days: i64,
}

impl MacroSeries {
    pub fn new(rows: Vec<MacroIndicatorRow>, max_staleness_days: i64) -> Self {
        let mut series: HashMap<FeatureColumn, BTreeMap<NaiveDate, f64>> = HashMap::new();

        for row in rows {
            let Some(value) = row.value.filter(|v| v.is_finite()) else {
                continue;
            };
            let column = FeatureColumn::macro_columns()
                .find(|c| c.macro_indicator_name().map_or(false, |n| n.eq_ignore_ascii_case(&row.indicator_name)));
            if let Some(column) = column {
                series.entry(column).or_default().insert(row.indicator_date, value);
            }
        }

        Self {
            series,
            max_staleness_days,
        }
    }

    pub fn lookup(&self, column: FeatureColumn, target: NaiveDate) -> Option<f64> {
        let candidate = self
            .series
            .get(&column)?
            .range(..=target)
            .next_back()
            .map(|(date, value)| (*date, *value));
        resolve_macro(target, candidate, self.max_staleness_days)
    }

    pub fn apply(&self, row: &mut MaterializedFeatureRow) {
        let target = row.key.price_date;
        for column in FeatureColumn::macro_columns() {
            row.set(column, self.lookup(column, target));
        }
    }

    pub fn len(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// On-chain metrics keyed by collection date. No fallback to other dates.
#[derive(Debug, Clone, Default)]
pub struct OnchainByDate(HashMap<NaiveDate, OnchainMetricRow>);

impl OnchainByDate {
    pub fn new(rows: Vec<OnchainMetricRow>) -> Self {
        // With duplicate rows for one date, the last one read wins.
        Self(rows.into_iter().map(|r| (r.collection_date, r)).collect())
    }

    pub fn apply(&self, row: &mut MaterializedFeatureRow) {
        if let Some(metric) = self.0.get(&row.key.price_date) {
            row.set(FeatureColumn::ActiveAddresses24h, metric.active_addresses_24h.map(|v| v as f64));
            row.set(FeatureColumn::TransactionCount24h, metric.transaction_count_24h.map(|v| v as f64));
            row.set(FeatureColumn::ExchangeNetFlow24h, metric.exchange_net_flow_24h);
            row.set(FeatureColumn::PriceVolatility7d, metric.price_volatility_7d);
        }
    }
}

/// Daily news aggregates keyed by date.
#[derive(Debug, Clone, Default)]
pub struct SentimentByDate(HashMap<NaiveDate, SentimentDay>);

impl SentimentByDate {
    pub fn new(rows: Vec<SentimentDay>) -> Self {
        Self(rows.into_iter().map(|r| (r.news_date, r)).collect())
    }

    /// Days without articles stay NULL rather than reporting a count of zero.
    pub fn apply(&self, row: &mut MaterializedFeatureRow) {
        if let Some(day) = self.0.get(&row.key.price_date).filter(|d| d.news_count > 0) {
            row.set(FeatureColumn::NewsCount, Some(day.news_count as f64));
            row.set(FeatureColumn::SentimentScore, day.avg_sentiment);
        }
    }
}

/// Values taken from one upstream `technical_indicators` row after validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedTechnicals {
    pub values: Vec<(FeatureColumn, f64)>,
    pub rejected: usize,
}

/// Check upstream indicator values against their invariants. Values that
/// break them are dropped, never repaired.
pub fn validate_upstream(row: &TechnicalIndicatorRow) -> ValidatedTechnicals {
    let mut out = ValidatedTechnicals::default();
    let accept = |column: FeatureColumn, value: Option<f64>, ok: bool, out: &mut ValidatedTechnicals| {
        if let Some(v) = value {
            if v.is_finite() && ok {
                out.values.push((column, v));
            } else {
                out.rejected += 1;
            }
        }
    };

    accept(FeatureColumn::Sma20, row.sma_20, true, &mut out);
    accept(FeatureColumn::Sma50, row.sma_50, true, &mut out);
    let rsi_ok = row.rsi_14.map_or(true, |v| (0.0..=100.0).contains(&v));
    accept(FeatureColumn::Rsi14, row.rsi_14, rsi_ok, &mut out);
    accept(FeatureColumn::Macd, row.macd, true, &mut out);
    accept(FeatureColumn::MacdSignal, row.macd_signal, true, &mut out);

    // Bands are only meaningful as a pair
    match (row.bollinger_upper, row.bollinger_lower) {
        (Some(upper), Some(lower)) if upper.is_finite() && lower.is_finite() && upper >= lower => {
            out.values.push((FeatureColumn::BbUpper, upper));
            out.values.push((FeatureColumn::BbLower, lower));
        }
        (None, None) => {}
        (upper, lower) => out.rejected += upper.is_some() as usize + lower.is_some() as usize,
    }

    out
}

/// Upstream indicator rows keyed by hour bucket, used to fill gaps only.
#[derive(Debug, Clone, Default)]
pub struct UpstreamTechnicals(HashMap<DateTime<Utc>, TechnicalIndicatorRow>);

impl UpstreamTechnicals {
    pub fn new(rows: Vec<TechnicalIndicatorRow>) -> Self {
        // Rows arrive ascending, so the latest row inside an hour wins.
        Self(rows.into_iter().map(|r| (hour_floor(r.time()), r)).collect())
    }

    /// Fill columns the computers left NULL. Returns the number of rejected values.
    pub fn fill_gaps(&self, row: &mut MaterializedFeatureRow) -> usize {
        let Some(upstream) = self.0.get(&row.bucket_start) else {
            return 0;
        };
        let validated = validate_upstream(upstream);

        // Don't mix a locally computed band with an upstream one
        let bands_local = row.get(FeatureColumn::BbUpper).is_some() || row.get(FeatureColumn::BbLower).is_some();
        for (column, value) in validated.values {
            if bands_local && matches!(column, FeatureColumn::BbUpper | FeatureColumn::BbLower) {
                continue;
            }
            row.fill(column, Some(value));
        }
        validated.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::symbol::Symbol;
    use chrono::{NaiveDateTime, TimeZone};

    fn obs(ts: &str, close: f64, volume: Option<f64>) -> PriceObservation {
        PriceObservation {
            symbol: "BTC".into(),
            timestamp: NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S").unwrap(),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close,
            volume,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row_at(day: &str) -> MaterializedFeatureRow {
        let start = Utc.from_utc_datetime(&date(day).and_hms_opt(10, 0, 0).unwrap());
        MaterializedFeatureRow::new(Symbol::normalize("BTC").unwrap(), start)
    }

    #[test]
    fn test_resample_groups_by_hour() {
        let bars = resample_hourly(&[
            obs("2024-03-15 10:05:00", 100.0, Some(1.0)),
            obs("2024-03-15 10:35:00", 104.0, Some(2.0)),
            obs("2024-03-15 10:55:00", 98.0, Some(3.0)),
            obs("2024-03-15 11:00:00", 101.0, Some(4.0)),
        ]);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].high, 104.0);
        assert_eq!(bars[0].low, 98.0);
        assert_eq!(bars[0].close, 98.0);
        assert_eq!(bars[0].volume, Some(6.0));
        assert_eq!(bars[1].close, 101.0);
    }

    #[test]
    fn test_resample_null_volume_poisons_bar() {
        let bars = resample_hourly(&[
            obs("2024-03-15 10:05:00", 100.0, Some(1.0)),
            obs("2024-03-15 10:35:00", 104.0, None),
        ]);
        assert_eq!(bars[0].volume, None);
    }

    #[test]
    fn test_macro_exact_match() {
        assert_eq!(resolve_macro(date("2024-03-15"), Some((date("2024-03-15"), 14.0)), 3), Some(14.0));
    }

    #[test]
    fn test_macro_stale_beyond_threshold_is_null() {
        // VIX last seen 2024-03-10, five days before the target
        assert_eq!(resolve_macro(date("2024-03-15"), Some((date("2024-03-10"), 14.0)), 3), None);
    }

    #[test]
    fn test_macro_within_threshold() {
        assert_eq!(resolve_macro(date("2024-03-15"), Some((date("2024-03-12"), 14.0)), 3), Some(14.0));
        assert_eq!(resolve_macro(date("2024-03-15"), None, 3), None);
    }

    #[test]
    fn test_macro_series_lookup() {
        let series = MacroSeries::new(
            vec![
                MacroIndicatorRow { indicator_name: "VIX".into(), indicator_date: date("2024-03-10"), value: Some(14.0) },
                MacroIndicatorRow { indicator_name: "DGS10".into(), indicator_date: date("2024-03-14"), value: Some(4.3) },
                MacroIndicatorRow { indicator_name: "UNKNOWN".into(), indicator_date: date("2024-03-14"), value: Some(1.0) },
            ],
            3,
        );
        let mut row = row_at("2024-03-15");
        series.apply(&mut row);
        assert_eq!(row.get(FeatureColumn::Vix), None);
        assert_eq!(row.get(FeatureColumn::Treasury10y), Some(4.3));
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_onchain_exact_date_only() {
        let joined = OnchainByDate::new(vec![OnchainMetricRow {
            coin_symbol: "bitcoin".into(),
            collection_date: date("2024-03-14"),
            active_addresses_24h: Some(900_000),
            transaction_count_24h: Some(350_000),
            exchange_net_flow_24h: Some(-1200.5),
            price_volatility_7d: None,
        }]);

        let mut same_day = row_at("2024-03-14");
        joined.apply(&mut same_day);
        assert_eq!(same_day.get(FeatureColumn::ActiveAddresses24h), Some(900_000.0));
        assert_eq!(same_day.get(FeatureColumn::PriceVolatility7d), None);

        let mut next_day = row_at("2024-03-15");
        joined.apply(&mut next_day);
        assert!(next_day.features.is_empty());
    }

    #[test]
    fn test_sentiment_zero_articles_stays_null() {
        let joined = SentimentByDate::new(vec![SentimentDay { news_date: date("2024-03-15"), news_count: 0, avg_sentiment: None }]);
        let mut row = row_at("2024-03-15");
        joined.apply(&mut row);
        assert!(row.features.is_empty());
    }

    fn upstream(rsi: Option<f64>, upper: Option<f64>, lower: Option<f64>) -> TechnicalIndicatorRow {
        TechnicalIndicatorRow {
            symbol: "BTC".into(),
            timestamp: NaiveDateTime::parse_from_str("2024-03-15 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            sma_20: Some(100.0),
            sma_50: None,
            rsi_14: rsi,
            macd: None,
            macd_signal: None,
            bollinger_upper: upper,
            bollinger_lower: lower,
        }
    }

    #[test]
    fn test_upstream_validation_rejects_broken_invariants() {
        let validated = validate_upstream(&upstream(Some(130.0), Some(90.0), Some(110.0)));
        assert_eq!(validated.rejected, 3);
        assert_eq!(validated.values, vec![(FeatureColumn::Sma20, 100.0)]);
    }

    #[test]
    fn test_upstream_fills_only_gaps() {
        let technicals = UpstreamTechnicals::new(vec![upstream(Some(40.0), Some(110.0), Some(90.0))]);
        let mut row = row_at("2024-03-15");
        row.set(FeatureColumn::Sma20, Some(101.0));

        let rejected = technicals.fill_gaps(&mut row);
        assert_eq!(rejected, 0);
        assert_eq!(row.get(FeatureColumn::Sma20), Some(101.0));
        assert_eq!(row.get(FeatureColumn::Rsi14), Some(40.0));
        assert_eq!(row.get(FeatureColumn::BbUpper), Some(110.0));
    }
}
