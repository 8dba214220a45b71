pub mod calculator;
pub mod ta;
pub mod volatility;
pub mod volume;

pub use self::calculator::{IndicatorState, TechnicalSnapshot};
pub use self::volatility::VolatilityCalculator;
pub use self::volume::VolumeCalculator;
