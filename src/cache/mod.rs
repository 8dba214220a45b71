pub mod checkpoint;
pub mod redis;

pub use self::checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, MemoryCheckpointStore};
pub use self::redis::{RedisCheckpointStore, RedisManager};
