pub mod collector;

pub use self::collector::CollectorClient;
