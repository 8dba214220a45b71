use crate::database::models::HourlyBar;
use crate::indicators::calculator::{last_n, sma};

/// Bollinger Bands output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

pub struct VolatilityCalculator;

impl VolatilityCalculator {
    /// Sample standard deviation (n - 1 denominator) of the last `period` values.
    pub fn sample_stddev(values: &[f64], period: usize) -> Option<f64> {
        if period < 2 {
            return None;
        }
        let window = last_n(values, period)?;
        let mean = window.iter().sum::<f64>() / period as f64;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (period - 1) as f64;
        Some(variance.sqrt())
    }

    /// SMA(period) ± multiplier · sample stddev(period).
    pub fn bollinger_bands(closes: &[f64], period: usize, multiplier: f64) -> Option<BollingerBands> {
        let middle = sma(closes, period)?;
        let deviation = Self::sample_stddev(closes, period)? * multiplier;

        Some(BollingerBands {
            upper: middle + deviation,
            middle,
            lower: middle - deviation,
        })
    }

    // TR = max(high - low, |high - prev_close|, |low - prev_close|)
    pub fn true_range(bar: &HourlyBar, prev_close: f64) -> f64 {
        let range1 = bar.high - bar.low;
        let range2 = (bar.high - prev_close).abs();
        let range3 = (bar.low - prev_close).abs();
        range1.max(range2).max(range3)
    }

    /// Mean true range over the last `period` bars. Needs `period + 1` bars
    /// because every true range looks at the previous close.
    pub fn average_true_range(bars: &[HourlyBar], period: usize) -> Option<f64> {
        if period == 0 {
            return None;
        }
        let window = last_n(bars, period + 1)?;
        let total: f64 = window
            .windows(2)
            .map(|pair| Self::true_range(&pair[1], pair[0].close))
            .sum();
        Some(total / period as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(i: i64, high: f64, low: f64, close: f64) -> HourlyBar {
        HourlyBar {
            bucket_start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(i),
            open: close,
            high,
            low,
            close,
            volume: Some(1.0),
        }
    }

    #[test]
    fn test_sample_stddev_uses_n_minus_one() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        // population stddev is 2.0, sample stddev is sqrt(32/7)
        let sd = VolatilityCalculator::sample_stddev(&values, 8).unwrap();
        assert!((sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_bollinger_requires_full_window() {
        let closes: Vec<f64> = (0..19).map(|i| 100.0 + i as f64).collect();
        assert!(VolatilityCalculator::bollinger_bands(&closes, 20, 2.0).is_none());
    }

    #[test]
    fn test_bollinger_upper_not_below_lower() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + ((i * 7) % 5) as f64).collect();
        let bands = VolatilityCalculator::bollinger_bands(&closes, 20, 2.0).unwrap();
        assert!(bands.upper >= bands.middle && bands.middle >= bands.lower);
    }

    #[test]
    fn test_atr_uses_previous_close() {
        let bars = vec![bar(0, 10.0, 9.0, 10.0), bar(1, 12.0, 11.0, 11.5), bar(2, 11.0, 10.0, 10.5)];
        // TR1 = max(1, 2, 1) = 2, TR2 = max(1, 0.5, 1.5) = 1.5
        let atr = VolatilityCalculator::average_true_range(&bars, 2).unwrap();
        assert!((atr - 1.75).abs() < 1e-12);
        assert!(VolatilityCalculator::average_true_range(&bars, 3).is_none());
    }
}
