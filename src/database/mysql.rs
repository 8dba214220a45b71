use crate::config::DatabaseSettings;
use crate::error::{FeatureError, Result};
use crate::utils::retry::{with_retry, with_timeout, RetryConfig};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Bounded MySQL pool plus the per-query timeout and retry policy every
/// reader and writer goes through.
#[derive(Clone)]
pub struct MySqlManager {
    pool: MySqlPool,
    query_timeout: Duration,
    retry: RetryConfig,
}

impl MySqlManager {
    pub async fn new(settings: &DatabaseSettings, retry: RetryConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.name);

        let query_timeout = Duration::from_secs(settings.query_timeout_secs);

        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(query_timeout)
            .connect_with(options)
            .await
            .map_err(|e| FeatureError::Connection(format!("failed to create MySQL pool: {}", e)))?;

        info!(
            host = %settings.host,
            port = settings.port,
            database = %settings.name,
            max_connections = settings.max_connections,
            "Connected to MySQL"
        );

        Ok(Self {
            pool,
            query_timeout,
            retry,
        })
    }

    /// Run one round-trip under the query timeout, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn(MySqlPool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.retry, operation, || {
            with_timeout(self.query_timeout, operation, f(self.pool.clone()))
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
