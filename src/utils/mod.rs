pub mod retry;
pub mod utils;

pub use retry::{with_retry, with_timeout, RetryConfig};
