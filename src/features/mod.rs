pub mod aligner;
pub mod row;
pub mod symbol;

pub use self::row::{FeatureColumn, FeatureGroup, FeatureKey, MaterializedFeatureRow};
pub use self::symbol::Symbol;
