use crate::database::models::HourlyBar;
use crate::indicators::calculator::last_n;

pub struct VolumeCalculator;

impl VolumeCalculator {
    /// Volume-weighted average of the typical price over the last `period` bars.
    ///
    /// Returns `None` when fewer than `period` bars exist, when any bar in the
    /// window has an unknown volume, or when the window traded nothing.
    pub fn vwap(bars: &[HourlyBar], period: usize) -> Option<f64> {
        let window = last_n(bars, period)?;

        let mut weighted = 0.0;
        let mut total_volume = 0.0;
        for bar in window {
            let volume = bar.volume?;
            weighted += bar.typical_price() * volume;
            total_volume += volume;
        }

        if total_volume <= 0.0 {
            return None;
        }
        Some(weighted / total_volume)
    }
}
