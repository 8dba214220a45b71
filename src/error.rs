// src/error.rs
use sqlx::mysql::MySqlDatabaseError;
use thiserror::Error;

/// MySQL server error numbers the materializer reacts to.
pub const ER_LOCK_DEADLOCK: u16 = 1213;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_BAD_FIELD_ERROR: u16 = 1054;
pub const ER_NO_SUCH_TABLE: u16 = 1146;

/// Error taxonomy shared by readers, writers, the driver and the collector client.
#[derive(Error, Debug)]
pub enum FeatureError {
    /// Not enough history to compute a value. Callers leave the field NULL.
    #[error("insufficient data for {what}: need {needed}, have {available}")]
    InsufficientData {
        what: String,
        needed: usize,
        available: usize,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("upstream API error (status {status:?}): {message}")]
    UpstreamApi {
        status: Option<u16>,
        message: String,
        retryable: bool,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl FeatureError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Deadlock(_) | Self::Timeout { .. } => true,
            Self::UpstreamApi { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn insufficient(what: impl Into<String>, needed: usize, available: usize) -> Self {
        Self::InsufficientData {
            what: what.into(),
            needed,
            available,
        }
    }
}

impl From<sqlx::Error> for FeatureError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                match db_err.try_downcast_ref::<MySqlDatabaseError>().map(|e| e.number()) {
                    Some(ER_LOCK_DEADLOCK) | Some(ER_LOCK_WAIT_TIMEOUT) => {
                        Self::Deadlock(db_err.message().to_string())
                    }
                    Some(ER_BAD_FIELD_ERROR) | Some(ER_NO_SUCH_TABLE) => {
                        Self::SchemaMismatch(db_err.message().to_string())
                    }
                    _ => Self::Database(err),
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            sqlx::Error::ColumnNotFound(column) => {
                Self::SchemaMismatch(format!("column {} not found in result set", column))
            }
            _ => Self::Database(err),
        }
    }
}

impl From<redis::RedisError> for FeatureError {
    fn from(err: redis::RedisError) -> Self {
        Self::Checkpoint(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for FeatureError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Checkpoint(err.to_string())
    }
}

impl From<reqwest::Error> for FeatureError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let retryable = err.is_timeout()
            || err.is_connect()
            || matches!(status, Some(429) | Some(500..=599));
        Self::UpstreamApi {
            status,
            message: err.to_string(),
            retryable,
        }
    }
}

pub type Result<T> = std::result::Result<T, FeatureError>;
