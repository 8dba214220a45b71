use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::utils::utils::from_naive;

/// Row from `price_data_real` / `price_data`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceObservation {
    pub symbol: String,
    pub timestamp: NaiveDateTime,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<f64>,
}

impl PriceObservation {
    pub fn time(&self) -> DateTime<Utc> {
        from_naive(self.timestamp)
    }
}

/// Row from `technical_indicators`, as computed by the upstream indicator service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TechnicalIndicatorRow {
    pub symbol: String,
    pub timestamp: NaiveDateTime,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub rsi_14: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub bollinger_lower: Option<f64>,
}

impl TechnicalIndicatorRow {
    pub fn time(&self) -> DateTime<Utc> {
        from_naive(self.timestamp)
    }
}

/// Row from `macro_indicators`. Not symbol-scoped.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MacroIndicatorRow {
    pub indicator_name: String,
    pub indicator_date: NaiveDate,
    pub value: Option<f64>,
}

/// Row from `crypto_onchain_data`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OnchainMetricRow {
    pub coin_symbol: String,
    pub collection_date: NaiveDate,
    pub active_addresses_24h: Option<i64>,
    pub transaction_count_24h: Option<i64>,
    pub exchange_net_flow_24h: Option<f64>,
    pub price_volatility_7d: Option<f64>,
}

/// Per-day aggregate over `crypto_news`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SentimentDay {
    pub news_date: NaiveDate,
    pub news_count: i64,
    pub avg_sentiment: Option<f64>,
}

/// Hourly OHLCV bar resampled from raw observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBar {
    /// Start of the hour bucket.
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// `None` if any constituent observation had a NULL volume.
    pub volume: Option<f64>,
}

impl HourlyBar {
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}
