use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FeatureError, Result};
use crate::features::symbol::Symbol;
use crate::utils::retry::{with_retry, RetryConfig};

#[derive(Debug, Clone, Serialize)]
pub struct CollectRequest<'a> {
    pub symbol: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Collector reply. Services differ in what they report, so every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CollectSummary {
    #[serde(default, alias = "records_inserted", alias = "inserted")]
    pub rows_inserted: Option<u64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Client for the OHLC collector service that gap-fills raw price data.
#[derive(Clone)]
pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl CollectorClient {
    pub fn new(base_url: &str, timeout: Duration, retry: RetryConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeatureError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Ask the collector to fill `[start, end)` for `symbol`. Rate limiting
    /// and server errors are retried.
    pub async fn collect(&self, symbol: &Symbol, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<CollectSummary> {
        let url = format!("{}/collect", self.base_url);
        let request = CollectRequest {
            symbol: symbol.as_str(),
            start,
            end,
        };

        let (http, url, request) = (&self.http, url.as_str(), &request);
        let summary = with_retry(&self.retry, "collector.collect", || async move {
            let response = http.post(url).json(request).send().await?;
            let status = response.status();

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FeatureError::UpstreamApi {
                    status: Some(status.as_u16()),
                    message: body,
                    retryable: status.as_u16() == 429 || status.is_server_error(),
                });
            }

            let body = response.text().await?;
            if body.trim().is_empty() {
                return Ok(CollectSummary::default());
            }
            Ok(serde_json::from_str::<CollectSummary>(&body).unwrap_or_else(|e| {
                debug!("Unrecognised collector reply ({}): {}", e, body);
                CollectSummary::default()
            }))
        })
        .await?;

        info!(
            symbol = %symbol,
            rows_inserted = ?summary.rows_inserted,
            "Collector gap-fill finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_collect_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/collect")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"symbol": "BTC"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"records_inserted": 24, "status": "ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = CollectorClient::new(&server.url(), Duration::from_secs(5), fast_retry()).unwrap();
        let (start, end) = range();
        let summary = client.collect(&Symbol::normalize("bitcoin").unwrap(), start, end).await.unwrap();

        assert_eq!(summary.rows_inserted, Some(24));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried_then_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/collect")
            .with_status(429)
            .with_body("slow down")
            .expect(3)
            .create_async()
            .await;

        let client = CollectorClient::new(&server.url(), Duration::from_secs(5), fast_retry()).unwrap();
        let (start, end) = range();
        let err = client.collect(&Symbol::normalize("ETH").unwrap(), start, end).await.unwrap_err();

        assert!(matches!(err, FeatureError::UpstreamApi { status: Some(429), retryable: true, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/collect")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = CollectorClient::new(&server.url(), Duration::from_secs(5), fast_retry()).unwrap();
        let (start, end) = range();
        let err = client.collect(&Symbol::normalize("SOL").unwrap(), start, end).await.unwrap_err();

        assert!(!err.is_retryable());
        mock.assert_async().await;
    }
}
