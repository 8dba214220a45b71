// Static model of the tables the materializer reads and writes.
// The live database is checked against it before any run; we never create
// or alter these tables ourselves.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{info, warn};

use crate::database::mysql::MySqlManager;
use crate::error::{FeatureError, Result};
use crate::features::row::FeatureColumn;

pub const SCHEMA_VERSION: u32 = 1;

pub const FEATURE_TABLE: &str = "ml_features_materialized";
pub const TECHNICAL_TABLE: &str = "technical_indicators";
pub const MACRO_TABLE: &str = "macro_indicators";
pub const ONCHAIN_TABLE: &str = "crypto_onchain_data";
pub const NEWS_TABLE: &str = "crypto_news";

/// Unique key the upsert relies on.
pub const FEATURE_KEY_COLUMNS: [&str; 3] = ["symbol", "price_date", "price_hour"];

/// Which raw price table to read. Deployments differ on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceTable {
    #[default]
    PriceDataReal,
    PriceData,
}

impl PriceTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTable::PriceDataReal => "price_data_real",
            PriceTable::PriceData => "price_data",
        }
    }
}

impl fmt::Display for PriceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for PriceTable {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "price_data" => PriceTable::PriceData,
            _ => PriceTable::PriceDataReal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
}

/// Tables and columns expected at `SCHEMA_VERSION`.
pub fn expected_tables(price_table: PriceTable) -> Vec<TableSpec> {
    let mut feature_columns = vec!["symbol", "price_date", "price_hour", "timestamp_iso", "updated_at"];
    feature_columns.extend(FeatureColumn::ALL.iter().map(|c| c.as_str()));

    vec![
        TableSpec {
            name: price_table.as_str(),
            columns: vec!["symbol", "timestamp", "open", "high", "low", "close", "volume"],
        },
        TableSpec {
            name: TECHNICAL_TABLE,
            columns: vec![
                "symbol",
                "timestamp",
                "sma_20",
                "sma_50",
                "rsi_14",
                "macd",
                "macd_signal",
                "bollinger_upper",
                "bollinger_lower",
            ],
        },
        TableSpec {
            name: MACRO_TABLE,
            columns: vec!["indicator_name", "indicator_date", "value"],
        },
        TableSpec {
            name: ONCHAIN_TABLE,
            columns: vec![
                "coin_symbol",
                "collection_date",
                "active_addresses_24h",
                "transaction_count_24h",
                "exchange_net_flow_24h",
                "price_volatility_7d",
            ],
        },
        TableSpec {
            name: NEWS_TABLE,
            columns: vec!["symbol", "published_at", "sentiment_score"],
        },
        TableSpec {
            name: FEATURE_TABLE,
            columns: feature_columns,
        },
    ]
}

/// Expected columns absent from `actual`. Comparison is case-insensitive.
pub fn missing_columns(expected: &TableSpec, actual: &HashSet<String>) -> Vec<&'static str> {
    expected
        .columns
        .iter()
        .filter(|c| !actual.contains(&c.to_lowercase()))
        .copied()
        .collect()
}

/// True if one of the unique indexes covers exactly `key`.
pub fn has_unique_key(unique_indexes: &BTreeMap<String, Vec<String>>, key: &[&str]) -> bool {
    unique_indexes.values().any(|columns| {
        columns.len() == key.len() && key.iter().all(|k| columns.iter().any(|c| c.eq_ignore_ascii_case(k)))
    })
}

/// Compare the live database with `expected_tables`. Every problem found is
/// reported in a single `SchemaMismatch`.
pub async fn verify_schema(db: &MySqlManager, price_table: PriceTable) -> Result<()> {
    let expected = expected_tables(price_table);

    let rows = db
        .run("verify_schema.columns", |pool| async move {
            let rows = sqlx::query(
                "SELECT CAST(TABLE_NAME AS CHAR) AS table_name, CAST(COLUMN_NAME AS CHAR) AS column_name
                 FROM information_schema.COLUMNS
                 WHERE TABLE_SCHEMA = DATABASE()",
            )
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        })
        .await?;

    let mut actual: HashMap<String, HashSet<String>> = HashMap::new();
    for row in rows {
        let table: String = row.try_get("table_name")?;
        let column: String = row.try_get("column_name")?;
        actual.entry(table.to_lowercase()).or_default().insert(column.to_lowercase());
    }

    let mut problems = Vec::new();
    for table in &expected {
        match actual.get(table.name) {
            None => problems.push(format!("table {} does not exist", table.name)),
            Some(columns) => {
                let missing = missing_columns(table, columns);
                if !missing.is_empty() {
                    problems.push(format!("{} is missing columns: {}", table.name, missing.join(", ")));
                }
            }
        }
    }

    let index_rows = db
        .run("verify_schema.indexes", |pool| async move {
            let rows = sqlx::query(
                "SELECT CAST(INDEX_NAME AS CHAR) AS index_name, CAST(COLUMN_NAME AS CHAR) AS column_name
                 FROM information_schema.STATISTICS
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND NON_UNIQUE = 0
                 ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            )
            .bind(FEATURE_TABLE)
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        })
        .await?;

    let mut unique_indexes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in index_rows {
        let index: String = row.try_get("index_name")?;
        let column: String = row.try_get("column_name")?;
        unique_indexes.entry(index).or_default().push(column);
    }

    if actual.contains_key(FEATURE_TABLE) && !has_unique_key(&unique_indexes, &FEATURE_KEY_COLUMNS) {
        problems.push(format!(
            "{} has no unique key on ({})",
            FEATURE_TABLE,
            FEATURE_KEY_COLUMNS.join(", ")
        ));
    }

    if problems.is_empty() {
        info!(schema_version = SCHEMA_VERSION, price_table = %price_table, "Schema verified");
        Ok(())
    } else {
        for problem in &problems {
            warn!("Schema problem: {}", problem);
        }
        Err(FeatureError::SchemaMismatch(format!(
            "schema version {} expected: {}",
            SCHEMA_VERSION,
            problems.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_feature_table_lists_every_feature_column() {
        let tables = expected_tables(PriceTable::PriceDataReal);
        let features = tables.iter().find(|t| t.name == FEATURE_TABLE).unwrap();
        assert_eq!(features.columns.len(), 5 + FeatureColumn::ALL.len());
        assert!(features.columns.contains(&"vwap_24h"));
    }

    #[test]
    fn test_price_table_selection() {
        assert_eq!(expected_tables(PriceTable::PriceData)[0].name, "price_data");
        assert_eq!(PriceTable::from("PRICE_DATA"), PriceTable::PriceData);
        assert_eq!(PriceTable::from("anything"), PriceTable::PriceDataReal);
    }

    #[test]
    fn test_missing_columns_reported() {
        let table = TableSpec {
            name: MACRO_TABLE,
            columns: vec!["indicator_name", "indicator_date", "value"],
        };
        assert!(missing_columns(&table, &columns(&["indicator_name", "indicator_date", "value", "source"])).is_empty());
        assert_eq!(missing_columns(&table, &columns(&["indicator_name"])), vec!["indicator_date", "value"]);
    }

    #[test]
    fn test_unique_key_detection() {
        let mut indexes = BTreeMap::new();
        indexes.insert("PRIMARY".to_string(), vec!["id".to_string()]);
        assert!(!has_unique_key(&indexes, &FEATURE_KEY_COLUMNS));

        indexes.insert(
            "uk_symbol_hour".to_string(),
            vec!["symbol".to_string(), "price_date".to_string(), "price_hour".to_string()],
        );
        assert!(has_unique_key(&indexes, &FEATURE_KEY_COLUMNS));
    }
}
