use crate::database::models::HourlyBar;
use crate::error::FeatureError;
use crate::features::row::{FeatureColumn, MaterializedFeatureRow};
use crate::indicators::ta::{MacdOutput, MovingAverageConvergenceDivergence, Next};
use crate::indicators::volatility::{BollingerBands, VolatilityCalculator};
use crate::indicators::volume::VolumeCalculator;

/// Bars kept per symbol; the longest window (SMA 50) needs this many.
pub const HISTORY_CAPACITY: usize = 50;

pub const SMA_SHORT: usize = 20;
pub const SMA_LONG: usize = 50;
pub const RSI_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_K: f64 = 2.0;
pub const VWAP_PERIOD: usize = 24;
pub const ATR_PERIOD: usize = 14;
/// Shortest lookback of any technical indicator (the fast EMA of MACD).
pub const MIN_HISTORY_BARS: usize = 12;

/// The last `n` items, or `None` if fewer exist.
pub fn last_n<T>(values: &[T], n: usize) -> Option<&[T]> {
    if n == 0 || values.len() < n {
        return None;
    }
    Some(&values[values.len() - n..])
}

/// Arithmetic mean of the last `period` values. Never approximated from a shorter window.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    let window = last_n(values, period)?;
    Some(window.iter().sum::<f64>() / period as f64)
}

/// RSI over the last `period` deltas (needs `period + 1` closes), using
/// simple averages of gains and losses.
///
/// No losses gives 100, no gains gives 0, a perfectly flat window gives 50.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    let window = last_n(closes, period + 1)?;

    let (mut gains, mut losses) = (0.0, 0.0);
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change >= 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    let value = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    };
    Some(value.clamp(0.0, 100.0))
}

/// Percentage change of the last close against the close `lag` bars earlier.
pub fn pct_change(closes: &[f64], lag: usize) -> Option<f64> {
    let window = last_n(closes, lag + 1)?;
    let base = window[0];
    if base == 0.0 {
        return None;
    }
    Some((window[lag] - base) / base * 100.0)
}

/// Technical values as of the close of the most recent bar pushed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TechnicalSnapshot {
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub ema_12: Option<f64>,
    pub ema_26: Option<f64>,
    pub rsi_14: Option<f64>,
    pub macd: Option<MacdOutput>,
    pub bollinger: Option<BollingerBands>,
    pub vwap_24h: Option<f64>,
    pub atr_14: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_24h: Option<f64>,
}

impl TechnicalSnapshot {
    /// True when the history was too short for every technical indicator.
    pub fn is_empty(&self) -> bool {
        self.sma_20.is_none()
            && self.sma_50.is_none()
            && self.ema_12.is_none()
            && self.ema_26.is_none()
            && self.rsi_14.is_none()
            && self.macd.is_none()
            && self.bollinger.is_none()
            && self.vwap_24h.is_none()
            && self.atr_14.is_none()
    }

    pub fn apply_to(&self, row: &mut MaterializedFeatureRow) {
        row.set(FeatureColumn::Sma20, self.sma_20);
        row.set(FeatureColumn::Sma50, self.sma_50);
        row.set(FeatureColumn::Ema12, self.ema_12);
        row.set(FeatureColumn::Ema26, self.ema_26);
        row.set(FeatureColumn::Rsi14, self.rsi_14);
        if let Some(macd) = self.macd {
            row.set(FeatureColumn::Macd, Some(macd.macd));
            row.set(FeatureColumn::MacdSignal, macd.signal);
            row.set(FeatureColumn::MacdHistogram, macd.histogram);
        }
        if let Some(bands) = self.bollinger {
            row.set(FeatureColumn::BbUpper, Some(bands.upper));
            row.set(FeatureColumn::BbMiddle, Some(bands.middle));
            row.set(FeatureColumn::BbLower, Some(bands.lower));
        }
        row.set(FeatureColumn::Vwap24h, self.vwap_24h);
        row.set(FeatureColumn::Atr14, self.atr_14);
        row.set(FeatureColumn::PriceChange1h, self.price_change_1h);
        row.set(FeatureColumn::PriceChange24h, self.price_change_24h);
    }
}

/// Per-symbol incremental indicator state.
///
/// Bars must be pushed in ascending time order. EMA and MACD are recurrences
/// over every bar seen; the windowed indicators look at the trailing history.
pub struct IndicatorState {
    history: Vec<HourlyBar>,
    closes: Vec<f64>,
    macd: MovingAverageConvergenceDivergence,
    last_macd: Option<MacdOutput>,
}

impl IndicatorState {
    pub fn new() -> Self {
        Self {
            history: Vec::with_capacity(HISTORY_CAPACITY * 2),
            closes: Vec::with_capacity(HISTORY_CAPACITY * 2),
            macd: MovingAverageConvergenceDivergence::standard(),
            last_macd: None,
        }
    }

    pub fn push(&mut self, bar: HourlyBar) {
        self.last_macd = self.macd.next(bar.close);
        self.closes.push(bar.close);
        self.history.push(bar);

        if self.history.len() >= HISTORY_CAPACITY * 2 {
            let excess = self.history.len() - HISTORY_CAPACITY;
            self.history.drain(..excess);
            self.closes.drain(..excess);
        }
    }

    pub fn bars_seen(&self) -> usize {
        self.history.len()
    }

    /// Why no technical value can exist yet, `None` once the shortest
    /// lookback is covered.
    pub fn insufficient_history(&self) -> Option<FeatureError> {
        let available = self.bars_seen();
        (available < MIN_HISTORY_BARS)
            .then(|| FeatureError::insufficient("technical indicators", MIN_HISTORY_BARS, available))
    }

    pub fn snapshot(&self) -> TechnicalSnapshot {
        let closes = &self.closes;

        TechnicalSnapshot {
            sma_20: sma(closes, SMA_SHORT),
            sma_50: sma(closes, SMA_LONG),
            ema_12: self.macd.fast(),
            ema_26: self.macd.slow(),
            rsi_14: rsi(closes, RSI_PERIOD),
            macd: self.last_macd,
            bollinger: VolatilityCalculator::bollinger_bands(closes, BOLLINGER_PERIOD, BOLLINGER_K),
            vwap_24h: VolumeCalculator::vwap(&self.history, VWAP_PERIOD),
            atr_14: VolatilityCalculator::average_true_range(&self.history, ATR_PERIOD),
            price_change_1h: pct_change(closes, 1),
            price_change_24h: pct_change(closes, 24),
        }
    }
}

impl Default for IndicatorState {
    fn default() -> Self {
        Self::new()
    }
}
