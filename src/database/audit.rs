use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::Row;

use crate::database::mysql::MySqlManager;
use crate::database::schema::FEATURE_TABLE;
use crate::error::Result;
use crate::features::row::{FeatureColumn, FeatureGroup};

/// Non-null counts per feature column over a date range of the materialized table.
#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub total_rows: i64,
    pub symbols: i64,
    pub columns: Vec<(FeatureColumn, i64)>,
}

impl CoverageReport {
    pub fn percent(&self, non_null: i64) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            non_null as f64 / self.total_rows as f64 * 100.0
        }
    }

    /// Mean column fill per feature group.
    pub fn by_group(&self) -> Vec<(FeatureGroup, f64)> {
        let groups = [
            FeatureGroup::Price,
            FeatureGroup::Technical,
            FeatureGroup::Macro,
            FeatureGroup::Onchain,
            FeatureGroup::Sentiment,
        ];
        groups
            .into_iter()
            .map(|group| {
                let counts: Vec<i64> = self
                    .columns
                    .iter()
                    .filter(|(c, _)| c.group() == group)
                    .map(|(_, n)| *n)
                    .collect();
                let mean = if counts.is_empty() {
                    0.0
                } else {
                    counts.iter().map(|n| self.percent(*n)).sum::<f64>() / counts.len() as f64
                };
                (group, mean)
            })
            .collect()
    }

    pub fn print(&self) {
        println!("Coverage of {} from {} to {}", FEATURE_TABLE, self.from, self.to);
        println!("Rows: {}  Symbols: {}", self.total_rows, self.symbols);
        println!("{:<24} | {:>10} | {:>7}", "Column", "Non-null", "Pct");
        println!("{:-<24}-+-{:-<10}-+-{:-<7}", "", "", "");
        for (column, count) in &self.columns {
            println!("{:<24} | {:>10} | {:>6.1}%", column.as_str(), count, self.percent(*count));
        }
        println!();
        for (group, pct) in self.by_group() {
            println!("{:<24} | {:>6.1}% (mean column fill)", group, pct);
        }
    }
}

/// Count what is actually stored. No value is inferred or defaulted.
pub async fn coverage(db: &Arc<MySqlManager>, from: NaiveDate, to: NaiveDate) -> Result<CoverageReport> {
    let counts: Vec<String> = FeatureColumn::ALL
        .iter()
        .map(|c| format!("COUNT({col}) AS {col}", col = c.as_str()))
        .collect();
    let sql = format!(
        "SELECT COUNT(*) AS total_rows, COUNT(DISTINCT symbol) AS symbols, {} FROM {} WHERE price_date >= ? AND price_date <= ?",
        counts.join(", "),
        FEATURE_TABLE
    );

    let sql = sql.as_str();
    let row = db
        .run("coverage", move |pool| async move {
            Ok(sqlx::query(sql).bind(from).bind(to).fetch_one(&pool).await?)
        })
        .await?;

    let mut columns = Vec::with_capacity(FeatureColumn::ALL.len());
    for column in FeatureColumn::ALL {
        columns.push((column, row.try_get::<i64, _>(column.as_str())?));
    }

    Ok(CoverageReport {
        from,
        to,
        total_rows: row.try_get("total_rows")?,
        symbols: row.try_get("symbols")?,
        columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_coverage() {
        let columns = FeatureColumn::ALL
            .iter()
            .map(|c| (*c, if c.group() == FeatureGroup::Price { 10 } else { 0 }))
            .collect();
        let report = CoverageReport {
            from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            total_rows: 20,
            symbols: 1,
            columns,
        };
        let groups = report.by_group();
        assert_eq!(groups[0], (FeatureGroup::Price, 50.0));
        assert_eq!(groups[2], (FeatureGroup::Macro, 0.0));
    }

    #[test]
    fn test_empty_table_reports_zero() {
        let report = CoverageReport {
            from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            total_rows: 0,
            symbols: 0,
            columns: vec![],
        };
        assert_eq!(report.percent(0), 0.0);
    }
}
