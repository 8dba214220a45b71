// Streaming indicators whose value depends on the whole history seen so far.
// These must be fed one symbol's closes in ascending time order.

/// The `Next` trait is used for indicators that consume one input at a time
pub trait Next<T> {
    type Output;
    fn next(&mut self, input: T) -> Self::Output;
}

/// Exponential Moving Average seeded with the SMA of the first `period` inputs.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    period: usize,
    alpha: f64,
    value: Option<f64>,
    seed_sum: f64,
    seen: usize,
}

impl ExponentialMovingAverage {
    pub fn new(period: usize) -> anyhow::Result<Self> {
        if period == 0 {
            return Err(anyhow::anyhow!("Period must be greater than 0"));
        }
        Ok(Self::with_period(period))
    }

    fn with_period(period: usize) -> Self {
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            value: None,
            seed_sum: 0.0,
            seen: 0,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Next<f64> for ExponentialMovingAverage {
    type Output = Option<f64>;

    fn next(&mut self, input: f64) -> Self::Output {
        match self.value {
            Some(prev) => {
                self.value = Some(input * self.alpha + prev * (1.0 - self.alpha));
            }
            None => {
                self.seed_sum += input;
                self.seen += 1;
                if self.seen == self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
        }
        self.value
    }
}

/// MACD output. Signal and histogram stay `None` until the signal EMA is seeded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: Option<f64>,
    pub histogram: Option<f64>,
}

/// Moving Average Convergence Divergence
#[derive(Debug, Clone)]
pub struct MovingAverageConvergenceDivergence {
    fast_ema: ExponentialMovingAverage,
    slow_ema: ExponentialMovingAverage,
    signal_ema: ExponentialMovingAverage,
}

impl MovingAverageConvergenceDivergence {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> anyhow::Result<Self> {
        if fast_period >= slow_period {
            return Err(anyhow::anyhow!("Fast period must be less than slow period"));
        }

        Ok(Self {
            fast_ema: ExponentialMovingAverage::new(fast_period)?,
            slow_ema: ExponentialMovingAverage::new(slow_period)?,
            signal_ema: ExponentialMovingAverage::new(signal_period)?,
        })
    }

    /// The conventional 12/26/9 configuration.
    pub fn standard() -> Self {
        Self {
            fast_ema: ExponentialMovingAverage::with_period(12),
            slow_ema: ExponentialMovingAverage::with_period(26),
            signal_ema: ExponentialMovingAverage::with_period(9),
        }
    }

    pub fn fast(&self) -> Option<f64> {
        self.fast_ema.value()
    }

    pub fn slow(&self) -> Option<f64> {
        self.slow_ema.value()
    }
}

impl Next<f64> for MovingAverageConvergenceDivergence {
    type Output = Option<MacdOutput>;

    fn next(&mut self, input: f64) -> Self::Output {
        let fast = self.fast_ema.next(input);
        let slow = self.slow_ema.next(input);

        // The MACD line only exists once both EMAs are seeded; the signal EMA
        // is fed MACD values only, so it seeds on the first `signal_period` of them.
        let macd = fast? - slow?;
        let signal = self.signal_ema.next(macd);

        Some(MacdOutput {
            macd,
            signal,
            histogram: signal.map(|s| macd - s),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_seeds_with_sma() {
        let mut ema = ExponentialMovingAverage::new(3).unwrap();
        assert_eq!(ema.next(1.0), None);
        assert_eq!(ema.next(2.0), None);
        assert_eq!(ema.next(3.0), Some(2.0));
        // alpha = 0.5
        assert_eq!(ema.next(6.0), Some(4.0));
    }

    #[test]
    fn test_ema_is_not_sma() {
        let closes = [10.0, 11.0, 12.0, 13.0, 20.0];
        let mut ema = ExponentialMovingAverage::new(3).unwrap();
        let mut last = None;
        for c in closes {
            last = ema.next(c);
        }
        let sma_last3 = (12.0 + 13.0 + 20.0) / 3.0;
        assert!((last.unwrap() - sma_last3).abs() > 1e-6);
    }

    #[test]
    fn test_macd_warmup() {
        let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).unwrap();
        let mut outputs = Vec::new();
        for i in 0..40 {
            outputs.push(macd.next(100.0 + i as f64));
        }
        // MACD line appears at the 26th close, signal at the 34th
        assert!(outputs[24].is_none());
        assert!(outputs[25].is_some());
        assert!(outputs[32].unwrap().signal.is_none());
        let seeded = outputs[33].unwrap();
        assert!(seeded.signal.is_some());
        assert!((seeded.histogram.unwrap() - (seeded.macd - seeded.signal.unwrap())).abs() < 1e-12);
    }

    #[test]
    fn test_macd_constant_series_is_zero() {
        let mut macd = MovingAverageConvergenceDivergence::new(12, 26, 9).unwrap();
        let mut last = None;
        for _ in 0..50 {
            last = macd.next(250.0);
        }
        let out = last.unwrap();
        assert!(out.macd.abs() < 1e-9);
        assert!(out.signal.unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_invalid_periods() {
        assert!(ExponentialMovingAverage::new(0).is_err());
        assert!(MovingAverageConvergenceDivergence::new(26, 12, 9).is_err());
    }
}
