pub mod job;
pub mod stats;
pub mod worker;

pub use self::job::{BackfillJob, JobKind, RowState, SkipReason};
pub use self::stats::{BackfillStats, SymbolReport};
pub use self::worker::{Worker, WorkerConfig};
