use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{MySql, QueryBuilder};
use tracing::debug;

use crate::database::mysql::MySqlManager;
use crate::database::schema::FEATURE_TABLE;
use crate::error::Result;
use crate::features::row::{FeatureColumn, MaterializedFeatureRow};

/// Rows per INSERT statement. Each row binds 35 parameters, well under
/// MySQL's 65535 placeholder limit.
pub const ROWS_PER_STATEMENT: usize = 500;

/// Destination of materialized rows.
#[async_trait]
pub trait FeatureSink: Send + Sync {
    /// Upsert `rows` atomically. Returns the number of rows written.
    async fn upsert_batch(&self, rows: &[MaterializedFeatureRow]) -> Result<usize>;
}

/// `ON DUPLICATE KEY UPDATE` clause. A NULL in the new row never replaces a
/// stored value.
pub fn on_duplicate_clause() -> String {
    let mut assignments = vec![
        "timestamp_iso = VALUES(timestamp_iso)".to_string(),
        "updated_at = NOW()".to_string(),
    ];
    assignments.extend(
        FeatureColumn::ALL
            .iter()
            .map(|c| format!("{col} = COALESCE(VALUES({col}), {col})", col = c.as_str())),
    );
    format!(" ON DUPLICATE KEY UPDATE {}", assignments.join(", "))
}

fn insert_prefix() -> String {
    let columns: Vec<&str> = ["symbol", "price_date", "price_hour", "timestamp_iso", "updated_at"]
        .into_iter()
        .chain(FeatureColumn::ALL.iter().map(|c| c.as_str()))
        .collect();
    format!("INSERT INTO {} ({}) ", FEATURE_TABLE, columns.join(", "))
}

fn build_upsert<'a>(rows: &'a [MaterializedFeatureRow]) -> QueryBuilder<'a, MySql> {
    let mut qb = QueryBuilder::<MySql>::new(insert_prefix());
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.key.symbol.as_str())
            .push_bind(row.key.price_date)
            .push_bind(row.key.price_hour)
            .push_bind(row.timestamp_iso())
            .push("NOW()");
        for column in FeatureColumn::ALL {
            b.push_bind(row.get(column));
        }
    });
    qb.push(on_duplicate_clause());
    qb
}

pub struct MySqlFeatureWriter {
    db: Arc<MySqlManager>,
}

impl MySqlFeatureWriter {
    pub fn new(db: Arc<MySqlManager>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FeatureSink for MySqlFeatureWriter {
    async fn upsert_batch(&self, rows: &[MaterializedFeatureRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        self.db
            .run("upsert_batch", move |pool| async move {
                let mut tx = pool.begin().await?;
                for chunk in rows.chunks(ROWS_PER_STATEMENT) {
                    build_upsert(chunk).build().execute(&mut *tx).await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;

        debug!(rows = rows.len(), "Upserted feature batch");
        Ok(rows.len())
    }
}
