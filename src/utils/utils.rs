use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use std::future::Future;
use std::time::Instant;
use tracing::debug;

// Measure execution time of an async operation
pub async fn measure_time<F, T>(operation_name: &str, f: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    debug!("{} completed in {:.2?}", operation_name, start.elapsed());
    result
}

// Format a timestamp for logging
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Truncate a timestamp to the start of its hour.
pub fn hour_floor(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// MySQL DATETIME columns are stored in UTC.
pub fn from_naive(time: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&time)
}

/// Parse either an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
pub fn parse_timestamp(input: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Ok(time.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid timestamp '{}': expected RFC 3339 or YYYY-MM-DD", input))?;
    Ok(from_naive(date.and_hms_opt(0, 0, 0).unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_floor() {
        let t = Utc.with_ymd_and_hms(2024, 3, 15, 13, 47, 12).unwrap();
        assert_eq!(hour_floor(t), Utc.with_ymd_and_hms(2024, 3, 15, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let a = parse_timestamp("2024-03-15").unwrap();
        let b = parse_timestamp("2024-03-15T00:00:00Z").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("15/03/2024").is_err());
    }
}
