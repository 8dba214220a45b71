pub mod audit;
pub mod models;
pub mod mysql;
pub mod schema;
pub mod sources;
pub mod writer;

pub use self::mysql::MySqlManager;
pub use self::sources::{MySqlSourceReader, SourceReader};
pub use self::writer::{FeatureSink, MySqlFeatureWriter};
