//! Runtime settings.
//!
//! Values come from an optional `materializer.toml` (or the file given with
//! `--config`), overridden by environment variables (`DB_HOST`, `BATCH_SIZE`,
//! ...). `.env` is loaded by `main` before this runs. Database credentials
//! have no defaults.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::database::schema::PriceTable;
use crate::error::{FeatureError, Result};
use crate::utils::retry::{RetryConfig, MAX_RETRY_LIMIT};

#[derive(Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
    pub query_timeout_secs: u64,
    pub price_table: PriceTable,
}

// Keep the password out of logs
impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("name", &self.name)
            .field("max_connections", &self.max_connections)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("price_table", &self.price_table)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    /// Rows per committed batch.
    pub batch_size: usize,
    /// Symbols processed at once.
    pub concurrency: usize,
    /// Hourly bars read before the range start to seed EMA/MACD.
    pub warmup_bars: usize,
    pub macro_max_staleness_days: i64,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub checkpoint_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub backfill: BackfillSettings,
    pub retry: RetryConfig,
    pub redis: Option<RedisSettings>,
    pub collector: Option<CollectorSettings>,
}

// Flat view of the sources; keys are the lower-cased environment names.
#[derive(Debug, Deserialize)]
struct RawSettings {
    db_host: String,
    db_port: u16,
    db_user: Option<String>,
    db_password: Option<String>,
    db_name: Option<String>,
    db_max_connections: u32,
    query_timeout_secs: u64,
    price_table: String,
    batch_size: usize,
    concurrency: Option<usize>,
    warmup_bars: usize,
    macro_max_staleness_days: i64,
    redis_url: Option<String>,
    checkpoint_ttl_secs: u64,
    collector_url: Option<String>,
    collector_timeout_secs: u64,
    retry_max: u32,
    retry_base_delay_ms: u64,
    retry_max_delay_ms: u64,
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(FeatureError::Config(format!("{} must be set", name))),
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Settings {
    /// Load from the settings file (if any) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::build(file, Environment::default())
    }

    /// Load from an explicit variable map instead of the process environment.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        Self::build(None, Environment::default().source(Some(vars)))
    }

    fn build(file: Option<&Path>, env: Environment) -> Result<Self> {
        let file_source = match file {
            Some(path) => File::from(path).required(true),
            None => File::with_name("materializer").required(false),
        };

        let raw: RawSettings = Config::builder()
            .set_default("db_host", "localhost")
            .and_then(|b| b.set_default("db_port", 3306_i64))
            .and_then(|b| b.set_default("db_max_connections", 10_i64))
            .and_then(|b| b.set_default("query_timeout_secs", 30_i64))
            .and_then(|b| b.set_default("price_table", "price_data_real"))
            .and_then(|b| b.set_default("batch_size", 1000_i64))
            .and_then(|b| b.set_default("warmup_bars", 250_i64))
            .and_then(|b| b.set_default("macro_max_staleness_days", 3_i64))
            .and_then(|b| b.set_default("checkpoint_ttl_secs", 7 * 24 * 3600_i64))
            .and_then(|b| b.set_default("collector_timeout_secs", 120_i64))
            .and_then(|b| b.set_default("retry_max", 3_i64))
            .and_then(|b| b.set_default("retry_base_delay_ms", 500_i64))
            .and_then(|b| b.set_default("retry_max_delay_ms", 30_000_i64))
            .map_err(|e| FeatureError::Config(e.to_string()))?
            .add_source(file_source)
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FeatureError::Config(e.to_string()))?;

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let database = DatabaseSettings {
            host: raw.db_host,
            port: raw.db_port,
            user: required(raw.db_user, "DB_USER")?,
            password: required(raw.db_password, "DB_PASSWORD")?,
            name: required(raw.db_name, "DB_NAME")?,
            max_connections: raw.db_max_connections,
            query_timeout_secs: raw.query_timeout_secs,
            price_table: PriceTable::from(raw.price_table.as_str()),
        };

        let backfill = BackfillSettings {
            batch_size: raw.batch_size,
            concurrency: raw.concurrency.unwrap_or_else(num_cpus::get),
            warmup_bars: raw.warmup_bars,
            macro_max_staleness_days: raw.macro_max_staleness_days,
        };

        let retry = RetryConfig {
            max_retries: raw.retry_max,
            base_delay: Duration::from_millis(raw.retry_base_delay_ms),
            max_delay: Duration::from_millis(raw.retry_max_delay_ms),
            ..RetryConfig::default()
        };

        let settings = Self {
            database,
            backfill,
            retry,
            redis: optional(raw.redis_url).map(|url| RedisSettings {
                url,
                checkpoint_ttl_secs: raw.checkpoint_ttl_secs,
            }),
            collector: optional(raw.collector_url).map(|url| CollectorSettings {
                url,
                timeout: Duration::from_secs(raw.collector_timeout_secs),
            }),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(FeatureError::Config("DB_MAX_CONNECTIONS must be at least 1".into()));
        }
        if self.database.query_timeout_secs == 0 {
            return Err(FeatureError::Config("QUERY_TIMEOUT_SECS must be at least 1".into()));
        }
        if self.backfill.batch_size == 0 {
            return Err(FeatureError::Config("BATCH_SIZE must be at least 1".into()));
        }
        if self.backfill.concurrency == 0 {
            return Err(FeatureError::Config("CONCURRENCY must be at least 1".into()));
        }
        if self.backfill.macro_max_staleness_days < 0 {
            return Err(FeatureError::Config("MACRO_MAX_STALENESS_DAYS cannot be negative".into()));
        }
        if self.retry.max_retries > MAX_RETRY_LIMIT {
            return Err(FeatureError::Config(format!("RETRY_MAX must be at most {}", MAX_RETRY_LIMIT)));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(FeatureError::Config("RETRY_BASE_DELAY_MS cannot exceed RETRY_MAX_DELAY_MS".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn credentials() -> Vec<(&'static str, &'static str)> {
        vec![("DB_USER", "materializer"), ("DB_PASSWORD", "s3cret"), ("DB_NAME", "crypto")]
    }

    #[test]
    fn test_defaults_applied() {
        let settings = Settings::from_vars(vars(&credentials())).unwrap();
        assert_eq!(settings.database.host, "localhost");
        assert_eq!(settings.database.port, 3306);
        assert_eq!(settings.database.price_table, PriceTable::PriceDataReal);
        assert_eq!(settings.backfill.batch_size, 1000);
        assert_eq!(settings.backfill.macro_max_staleness_days, 3);
        assert!(settings.backfill.concurrency >= 1);
        assert!(settings.redis.is_none());
        assert!(settings.collector.is_none());
    }

    #[test]
    fn test_missing_password_is_an_error() {
        let err = Settings::from_vars(vars(&[("DB_USER", "u"), ("DB_NAME", "db")])).unwrap_err();
        assert!(matches!(err, FeatureError::Config(ref m) if m.contains("DB_PASSWORD")));
    }

    #[test]
    fn test_blank_user_is_an_error() {
        let mut pairs = credentials();
        pairs[0] = ("DB_USER", "  ");
        assert!(Settings::from_vars(vars(&pairs)).is_err());
    }

    #[test]
    fn test_overrides_and_optional_services() {
        let mut pairs = credentials();
        pairs.extend([
            ("DB_PORT", "3307"),
            ("BATCH_SIZE", "250"),
            ("CONCURRENCY", "2"),
            ("PRICE_TABLE", "price_data"),
            ("REDIS_URL", "redis://127.0.0.1:6379"),
            ("COLLECTOR_URL", "http://collector:8000"),
        ]);
        let settings = Settings::from_vars(vars(&pairs)).unwrap();
        assert_eq!(settings.database.port, 3307);
        assert_eq!(settings.backfill.batch_size, 250);
        assert_eq!(settings.backfill.concurrency, 2);
        assert_eq!(settings.database.price_table, PriceTable::PriceData);
        assert!(settings.redis.is_some());
        assert_eq!(settings.collector.unwrap().url, "http://collector:8000");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut pairs = credentials();
        pairs.push(("BATCH_SIZE", "0"));
        assert!(Settings::from_vars(vars(&pairs)).is_err());
    }

    #[test]
    fn test_retry_budget_is_bounded() {
        let mut pairs = credentials();
        pairs.push(("RETRY_MAX", "100"));
        let err = Settings::from_vars(vars(&pairs)).unwrap_err();
        assert!(matches!(err, FeatureError::Config(ref m) if m.contains("RETRY_MAX")));

        let mut pairs = credentials();
        pairs.push(("RETRY_MAX", "20"));
        assert_eq!(Settings::from_vars(vars(&pairs)).unwrap().retry.max_retries, 20);
    }

    #[test]
    fn test_password_not_in_debug_output() {
        let settings = Settings::from_vars(vars(&credentials())).unwrap();
        assert!(!format!("{:?}", settings).contains("s3cret"));
    }
}
