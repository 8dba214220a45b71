use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{MySql, QueryBuilder, Row};
use tracing::debug;

use crate::database::models::{
    MacroIndicatorRow, OnchainMetricRow, PriceObservation, SentimentDay, TechnicalIndicatorRow,
};
use crate::database::mysql::MySqlManager;
use crate::database::schema::{PriceTable, MACRO_TABLE, NEWS_TABLE, ONCHAIN_TABLE, TECHNICAL_TABLE};
use crate::error::Result;
use crate::features::symbol::Symbol;

/// Read-only access to the source tables. Empty results mean "no data",
/// never an error.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Distinct normalized symbols present in the price table.
    async fn symbols(&self) -> Result<Vec<Symbol>>;

    /// Last `limit` observations strictly before `before`, oldest first.
    async fn price_history_before(
        &self,
        symbol: &Symbol,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PriceObservation>>;

    /// Observations in `[from, to)`, oldest first.
    async fn price_observations(
        &self,
        symbol: &Symbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>>;

    async fn technical_rows(
        &self,
        symbol: &Symbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TechnicalIndicatorRow>>;

    /// Macro rows for the named indicators with `from <= date <= to`.
    async fn macro_rows(&self, names: &[&str], from: NaiveDate, to: NaiveDate) -> Result<Vec<MacroIndicatorRow>>;

    async fn onchain_rows(&self, symbol: &Symbol, from: NaiveDate, to: NaiveDate) -> Result<Vec<OnchainMetricRow>>;

    /// Article count and mean sentiment per calendar day.
    async fn sentiment_days(&self, symbol: &Symbol, from: NaiveDate, to: NaiveDate) -> Result<Vec<SentimentDay>>;
}

const PRICE_COLUMNS: &str = "symbol, timestamp, CAST(open AS DOUBLE) AS open, CAST(high AS DOUBLE) AS high, \
     CAST(low AS DOUBLE) AS low, CAST(close AS DOUBLE) AS close, CAST(volume AS DOUBLE) AS volume";

// Sources disagree on symbol spelling, so every symbol-scoped query matches
// the whole alias set.
fn push_aliases(qb: &mut QueryBuilder<'_, MySql>, column: &str, aliases: &[String]) {
    qb.push(format!("{} IN (", column));
    let mut separated = qb.separated(", ");
    for alias in aliases {
        separated.push_bind(alias.clone());
    }
    separated.push_unseparated(")");
}

pub struct MySqlSourceReader {
    db: Arc<MySqlManager>,
    price_table: PriceTable,
}

impl MySqlSourceReader {
    pub fn new(db: Arc<MySqlManager>, price_table: PriceTable) -> Self {
        Self { db, price_table }
    }
}

#[async_trait]
impl SourceReader for MySqlSourceReader {
    async fn symbols(&self) -> Result<Vec<Symbol>> {
        let table = self.price_table.as_str();
        let rows = self
            .db
            .run("symbols", |pool| async move {
                let sql = format!("SELECT DISTINCT CAST(symbol AS CHAR) AS symbol FROM {} WHERE close IS NOT NULL", table);
                Ok(sqlx::query(&sql).fetch_all(&pool).await?)
            })
            .await?;

        let mut symbols = BTreeSet::new();
        for row in rows {
            let raw: String = row.try_get("symbol")?;
            match Symbol::normalize(&raw) {
                Some(symbol) => {
                    symbols.insert(symbol);
                }
                None => debug!("Ignoring unusable symbol {:?}", raw),
            }
        }
        Ok(symbols.into_iter().collect())
    }

    async fn price_history_before(
        &self,
        symbol: &Symbol,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PriceObservation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let aliases = symbol.aliases();
        let aliases = &aliases;
        let table = self.price_table.as_str();

        let mut rows = self
            .db
            .run("price_history_before", move |pool| {
                async move {
                    let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {} FROM {} WHERE ", PRICE_COLUMNS, table));
                    push_aliases(&mut qb, "symbol", aliases);
                    qb.push(" AND close IS NOT NULL AND timestamp < ");
                    qb.push_bind(before.naive_utc());
                    qb.push(" ORDER BY timestamp DESC LIMIT ");
                    qb.push_bind(limit as i64);
                    Ok(qb.build_query_as::<PriceObservation>().fetch_all(&pool).await?)
                }
            })
            .await?;

        rows.reverse();
        Ok(rows)
    }

    async fn price_observations(
        &self,
        symbol: &Symbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>> {
        let aliases = symbol.aliases();
        let aliases = &aliases;
        let table = self.price_table.as_str();

        self.db
            .run("price_observations", move |pool| {
                async move {
                    let mut qb = QueryBuilder::<MySql>::new(format!("SELECT {} FROM {} WHERE ", PRICE_COLUMNS, table));
                    push_aliases(&mut qb, "symbol", aliases);
                    qb.push(" AND close IS NOT NULL AND timestamp >= ");
                    qb.push_bind(from.naive_utc());
                    qb.push(" AND timestamp < ");
                    qb.push_bind(to.naive_utc());
                    qb.push(" ORDER BY timestamp ASC");
                    Ok(qb.build_query_as::<PriceObservation>().fetch_all(&pool).await?)
                }
            })
            .await
    }

    async fn technical_rows(
        &self,
        symbol: &Symbol,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TechnicalIndicatorRow>> {
        let aliases = symbol.aliases();
        let aliases = &aliases;

        self.db
            .run("technical_rows", move |pool| {
                async move {
                    let mut qb = QueryBuilder::<MySql>::new(format!(
                        "SELECT symbol, timestamp, CAST(sma_20 AS DOUBLE) AS sma_20, CAST(sma_50 AS DOUBLE) AS sma_50, \
                         CAST(rsi_14 AS DOUBLE) AS rsi_14, CAST(macd AS DOUBLE) AS macd, \
                         CAST(macd_signal AS DOUBLE) AS macd_signal, CAST(bollinger_upper AS DOUBLE) AS bollinger_upper, \
                         CAST(bollinger_lower AS DOUBLE) AS bollinger_lower FROM {} WHERE ",
                        TECHNICAL_TABLE
                    ));
                    push_aliases(&mut qb, "symbol", aliases);
                    qb.push(" AND timestamp >= ");
                    qb.push_bind(from.naive_utc());
                    qb.push(" AND timestamp < ");
                    qb.push_bind(to.naive_utc());
                    qb.push(" ORDER BY timestamp ASC");
                    Ok(qb.build_query_as::<TechnicalIndicatorRow>().fetch_all(&pool).await?)
                }
            })
            .await
    }

    async fn macro_rows(&self, names: &[&str], from: NaiveDate, to: NaiveDate) -> Result<Vec<MacroIndicatorRow>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let names = &names;

        self.db
            .run("macro_rows", move |pool| {
                async move {
                    let mut qb = QueryBuilder::<MySql>::new(format!(
                        "SELECT indicator_name, indicator_date, CAST(value AS DOUBLE) AS value FROM {} WHERE ",
                        MACRO_TABLE
                    ));
                    push_aliases(&mut qb, "indicator_name", names);
                    qb.push(" AND indicator_date >= ");
                    qb.push_bind(from);
                    qb.push(" AND indicator_date <= ");
                    qb.push_bind(to);
                    qb.push(" ORDER BY indicator_date ASC");
                    Ok(qb.build_query_as::<MacroIndicatorRow>().fetch_all(&pool).await?)
                }
            })
            .await
    }

    async fn onchain_rows(&self, symbol: &Symbol, from: NaiveDate, to: NaiveDate) -> Result<Vec<OnchainMetricRow>> {
        let aliases = symbol.aliases();
        let aliases = &aliases;

        self.db
            .run("onchain_rows", move |pool| {
                async move {
                    let mut qb = QueryBuilder::<MySql>::new(format!(
                        "SELECT coin_symbol, collection_date, \
                         CAST(active_addresses_24h AS SIGNED) AS active_addresses_24h, \
                         CAST(transaction_count_24h AS SIGNED) AS transaction_count_24h, \
                         CAST(exchange_net_flow_24h AS DOUBLE) AS exchange_net_flow_24h, \
                         CAST(price_volatility_7d AS DOUBLE) AS price_volatility_7d FROM {} WHERE ",
                        ONCHAIN_TABLE
                    ));
                    push_aliases(&mut qb, "coin_symbol", aliases);
                    qb.push(" AND collection_date >= ");
                    qb.push_bind(from);
                    qb.push(" AND collection_date <= ");
                    qb.push_bind(to);
                    qb.push(" ORDER BY collection_date ASC");
                    Ok(qb.build_query_as::<OnchainMetricRow>().fetch_all(&pool).await?)
                }
            })
            .await
    }

    async fn sentiment_days(&self, symbol: &Symbol, from: NaiveDate, to: NaiveDate) -> Result<Vec<SentimentDay>> {
        let aliases = symbol.aliases();
        let aliases = &aliases;
        let start = from.and_time(NaiveTime::default());
        let end = to.succ_opt().unwrap_or(to).and_time(NaiveTime::default());

        self.db
            .run("sentiment_days", move |pool| {
                async move {
                    let mut qb = QueryBuilder::<MySql>::new(format!(
                        "SELECT DATE(published_at) AS news_date, COUNT(*) AS news_count, \
                         CAST(AVG(sentiment_score) AS DOUBLE) AS avg_sentiment FROM {} WHERE ",
                        NEWS_TABLE
                    ));
                    push_aliases(&mut qb, "symbol", aliases);
                    qb.push(" AND published_at >= ");
                    qb.push_bind(start);
                    qb.push(" AND published_at < ");
                    qb.push_bind(end);
                    qb.push(" GROUP BY DATE(published_at) ORDER BY news_date ASC");
                    Ok(qb.build_query_as::<SentimentDay>().fetch_all(&pool).await?)
                }
            })
            .await
    }
}
