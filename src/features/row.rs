use crate::features::symbol::Symbol;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Feature groups, used for coverage reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureGroup {
    Price,
    Technical,
    Macro,
    Onchain,
    Sentiment,
}

impl fmt::Display for FeatureGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureGroup::Price => write!(f, "price"),
            FeatureGroup::Technical => write!(f, "technical"),
            FeatureGroup::Macro => write!(f, "macro"),
            FeatureGroup::Onchain => write!(f, "onchain"),
            FeatureGroup::Sentiment => write!(f, "sentiment"),
        }
    }
}

/// Nullable feature columns of `ml_features_materialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureColumn {
    CurrentPrice,
    OpenPrice,
    HighPrice,
    LowPrice,
    Volume,
    PriceChange1h,
    PriceChange24h,
    Sma20,
    Sma50,
    Ema12,
    Ema26,
    Rsi14,
    Macd,
    MacdSignal,
    MacdHistogram,
    BbUpper,
    BbMiddle,
    BbLower,
    Vwap24h,
    Atr14,
    Vix,
    Dxy,
    FedFundsRate,
    Treasury10y,
    Sp500,
    ActiveAddresses24h,
    TransactionCount24h,
    ExchangeNetFlow24h,
    PriceVolatility7d,
    SentimentScore,
    NewsCount,
}

impl FeatureColumn {
    pub const ALL: [FeatureColumn; 31] = [
        FeatureColumn::CurrentPrice,
        FeatureColumn::OpenPrice,
        FeatureColumn::HighPrice,
        FeatureColumn::LowPrice,
        FeatureColumn::Volume,
        FeatureColumn::PriceChange1h,
        FeatureColumn::PriceChange24h,
        FeatureColumn::Sma20,
        FeatureColumn::Sma50,
        FeatureColumn::Ema12,
        FeatureColumn::Ema26,
        FeatureColumn::Rsi14,
        FeatureColumn::Macd,
        FeatureColumn::MacdSignal,
        FeatureColumn::MacdHistogram,
        FeatureColumn::BbUpper,
        FeatureColumn::BbMiddle,
        FeatureColumn::BbLower,
        FeatureColumn::Vwap24h,
        FeatureColumn::Atr14,
        FeatureColumn::Vix,
        FeatureColumn::Dxy,
        FeatureColumn::FedFundsRate,
        FeatureColumn::Treasury10y,
        FeatureColumn::Sp500,
        FeatureColumn::ActiveAddresses24h,
        FeatureColumn::TransactionCount24h,
        FeatureColumn::ExchangeNetFlow24h,
        FeatureColumn::PriceVolatility7d,
        FeatureColumn::SentimentScore,
        FeatureColumn::NewsCount,
    ];

    /// Column name in `ml_features_materialized`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureColumn::CurrentPrice => "current_price",
            FeatureColumn::OpenPrice => "open_price",
            FeatureColumn::HighPrice => "high_price",
            FeatureColumn::LowPrice => "low_price",
            FeatureColumn::Volume => "volume",
            FeatureColumn::PriceChange1h => "price_change_1h",
            FeatureColumn::PriceChange24h => "price_change_24h",
            FeatureColumn::Sma20 => "sma_20",
            FeatureColumn::Sma50 => "sma_50",
            FeatureColumn::Ema12 => "ema_12",
            FeatureColumn::Ema26 => "ema_26",
            FeatureColumn::Rsi14 => "rsi_14",
            FeatureColumn::Macd => "macd",
            FeatureColumn::MacdSignal => "macd_signal",
            FeatureColumn::MacdHistogram => "macd_histogram",
            FeatureColumn::BbUpper => "bb_upper",
            FeatureColumn::BbMiddle => "bb_middle",
            FeatureColumn::BbLower => "bb_lower",
            FeatureColumn::Vwap24h => "vwap_24h",
            FeatureColumn::Atr14 => "atr_14",
            FeatureColumn::Vix => "vix",
            FeatureColumn::Dxy => "dxy",
            FeatureColumn::FedFundsRate => "fed_funds_rate",
            FeatureColumn::Treasury10y => "treasury_10y",
            FeatureColumn::Sp500 => "sp500",
            FeatureColumn::ActiveAddresses24h => "active_addresses_24h",
            FeatureColumn::TransactionCount24h => "transaction_count_24h",
            FeatureColumn::ExchangeNetFlow24h => "exchange_net_flow_24h",
            FeatureColumn::PriceVolatility7d => "price_volatility_7d",
            FeatureColumn::SentimentScore => "sentiment_score",
            FeatureColumn::NewsCount => "news_count",
        }
    }

    pub fn group(&self) -> FeatureGroup {
        use FeatureColumn::*;
        match self {
            CurrentPrice | OpenPrice | HighPrice | LowPrice | Volume | PriceChange1h | PriceChange24h => {
                FeatureGroup::Price
            }
            Sma20 | Sma50 | Ema12 | Ema26 | Rsi14 | Macd | MacdSignal | MacdHistogram | BbUpper
            | BbMiddle | BbLower | Vwap24h | Atr14 => FeatureGroup::Technical,
            Vix | Dxy | FedFundsRate | Treasury10y | Sp500 => FeatureGroup::Macro,
            ActiveAddresses24h | TransactionCount24h | ExchangeNetFlow24h | PriceVolatility7d => {
                FeatureGroup::Onchain
            }
            SentimentScore | NewsCount => FeatureGroup::Sentiment,
        }
    }

    /// `macro_indicators.indicator_name` feeding a macro column.
    pub fn macro_indicator_name(&self) -> Option<&'static str> {
        match self {
            FeatureColumn::Vix => Some("VIX"),
            FeatureColumn::Dxy => Some("DXY"),
            FeatureColumn::FedFundsRate => Some("FEDFUNDS"),
            FeatureColumn::Treasury10y => Some("DGS10"),
            FeatureColumn::Sp500 => Some("SP500"),
            _ => None,
        }
    }

    pub fn macro_columns() -> impl Iterator<Item = FeatureColumn> {
        Self::ALL.into_iter().filter(|c| c.group() == FeatureGroup::Macro)
    }
}

impl fmt::Display for FeatureColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique key of a materialized row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureKey {
    pub symbol: Symbol,
    pub price_date: NaiveDate,
    pub price_hour: u8,
}

impl FeatureKey {
    pub fn from_bucket(symbol: Symbol, bucket_start: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price_date: bucket_start.date_naive(),
            price_hour: bucket_start.hour() as u8,
        }
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {:02}:00", self.symbol, self.price_date, self.price_hour)
    }
}

/// One denormalized feature vector. Columns missing from `features` are NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedFeatureRow {
    pub key: FeatureKey,
    pub bucket_start: DateTime<Utc>,
    pub features: BTreeMap<FeatureColumn, f64>,
}

impl MaterializedFeatureRow {
    pub fn new(symbol: Symbol, bucket_start: DateTime<Utc>) -> Self {
        Self {
            key: FeatureKey::from_bucket(symbol, bucket_start),
            bucket_start,
            features: BTreeMap::new(),
        }
    }

    /// Set a column if a value is available. Non-finite values are dropped.
    pub fn set(&mut self, column: FeatureColumn, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.features.insert(column, v);
        }
    }

    /// Set a column only if nothing has been computed for it yet.
    pub fn fill(&mut self, column: FeatureColumn, value: Option<f64>) -> bool {
        if self.features.contains_key(&column) {
            return false;
        }
        let before = self.features.len();
        self.set(column, value);
        self.features.len() > before
    }

    pub fn get(&self, column: FeatureColumn) -> Option<f64> {
        self.features.get(&column).copied()
    }

    pub fn has_group(&self, group: FeatureGroup) -> bool {
        self.features.keys().any(|c| c.group() == group)
    }

    /// Gap-filling merge: newly available values win, absent ones never erase.
    pub fn merge_from(&mut self, newer: &MaterializedFeatureRow) {
        for (column, value) in &newer.features {
            self.features.insert(*column, *value);
        }
        self.bucket_start = newer.bucket_start;
    }

    /// `timestamp_iso` column value.
    pub fn timestamp_iso(&self) -> String {
        self.bucket_start.to_rfc3339()
    }
}
