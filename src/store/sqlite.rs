// SQLite metric store. Raw samples are stored as one document row per (resource, timestamp)
// with one entry row per metric; aggregate records are append-only.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

use super::{DurableWrite, MetricStore, RawQuery, TaskJournal};
use crate::bucket::{MICROS_PER_DAY, now_micros};
use crate::error::Result;
use crate::models::{AggregateRecord, RawSample, ResourceMetrics, TimeBin};

pub struct SqliteMetricStore {
    pool: SqlitePool,
    retention_micros: i64,
}

impl SqliteMetricStore {
    pub async fn connect(
        path: &str,
        max_pool_size: u32,
        retention_days: u32,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_pool_size)
            .connect_with(opts)
            .await?;
        Ok(Self {
            pool,
            retention_micros: retention_days as i64 * MICROS_PER_DAY,
        })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_metric_docs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                timestamp_micros INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_metric_entries (
                doc_id INTEGER NOT NULL,
                metric TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (doc_id, metric)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_docs_resource_ts ON raw_metric_docs(resource_id, timestamp_micros)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_raw_docs_expires_at ON raw_metric_docs(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aggregate_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                value REAL NOT NULL,
                timestamp_micros INTEGER NOT NULL,
                published_micros INTEGER NOT NULL,
                bin_avg REAL,
                bin_min REAL,
                bin_max REAL,
                bin_sum REAL,
                bin_count INTEGER,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_aggregates_resource_key ON aggregate_records(resource_id, metric_key, published_micros)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_aggregates_expires_at ON aggregate_records(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        TaskJournal::init_table(&self.pool).await?;

        Ok(())
    }

    /// Task journal sharing this store's pool.
    pub fn journal(&self) -> TaskJournal {
        TaskJournal::new(self.pool.clone())
    }

    #[instrument(skip(self), fields(repo = "metrics", operation = "vacuum"))]
    pub async fn vacuum(&self) -> anyhow::Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    fn parse_aggregate_row(row: &SqliteRow) -> Result<AggregateRecord> {
        let count: Option<i64> = row.try_get("bin_count")?;
        let bin = match count {
            Some(count) => Some(TimeBin {
                avg: row.try_get("bin_avg")?,
                min: row.try_get("bin_min")?,
                max: row.try_get("bin_max")?,
                sum: row.try_get("bin_sum")?,
                count: count.max(0) as u64,
                latest: None,
                latest_micros: None,
            }),
            None => None,
        };
        Ok(AggregateRecord {
            resource_id: row.try_get("resource_id")?,
            key: row.try_get("metric_key")?,
            value: row.try_get("value")?,
            timestamp_micros: row.try_get("timestamp_micros")?,
            published_micros: row.try_get("published_micros")?,
            bin,
        })
    }
}

async fn insert_raw(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    doc: &ResourceMetrics,
    expires_at: i64,
) -> Result<()> {
    let doc_id: i64 = sqlx::query_scalar(
        "INSERT INTO raw_metric_docs (resource_id, timestamp_micros, expires_at) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(&doc.resource_id)
    .bind(doc.timestamp_micros)
    .bind(expires_at)
    .fetch_one(&mut **tx)
    .await?;
    for (metric, value) in &doc.entries {
        sqlx::query("INSERT INTO raw_metric_entries (doc_id, metric, value) VALUES ($1, $2, $3)")
            .bind(doc_id)
            .bind(metric)
            .bind(*value)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn insert_aggregate(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &AggregateRecord,
    expires_at: i64,
) -> Result<()> {
    let bin = record.bin.as_ref();
    sqlx::query(
        r#"
        INSERT INTO aggregate_records
        (resource_id, metric_key, value, timestamp_micros, published_micros,
         bin_avg, bin_min, bin_max, bin_sum, bin_count, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(&record.resource_id)
    .bind(&record.key)
    .bind(record.value)
    .bind(record.timestamp_micros)
    .bind(record.published_micros)
    .bind(bin.and_then(|b| b.avg))
    .bind(bin.and_then(|b| b.min))
    .bind(bin.and_then(|b| b.max))
    .bind(bin.and_then(|b| b.sum))
    .bind(bin.map(|b| b.count as i64))
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl MetricStore for SqliteMetricStore {
    #[instrument(skip(self, writes), fields(repo = "metrics", operation = "write_batch", writes_count = writes.len()))]
    async fn write_batch(&self, writes: &[DurableWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let expires_at = now_micros() + self.retention_micros;
        let mut tx = self.pool.begin().await?;
        for write in writes {
            match write {
                DurableWrite::Raw(doc) => insert_raw(&mut tx, doc, expires_at).await?,
                DurableWrite::Aggregate(record) => {
                    insert_aggregate(&mut tx, record, expires_at).await?
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "metrics", operation = "latest_aggregate"))]
    async fn latest_aggregate(
        &self,
        resource_id: &str,
        key: &str,
    ) -> Result<Option<AggregateRecord>> {
        let row = sqlx::query(
            "SELECT * FROM aggregate_records
             WHERE resource_id = $1 AND metric_key = $2 AND value >= 0
             ORDER BY published_micros DESC, id DESC LIMIT 1",
        )
        .bind(resource_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_aggregate_row).transpose()
    }

    #[instrument(skip(self, query), fields(repo = "metrics", operation = "query_raw", clauses = query.clauses.len()))]
    async fn query_raw(&self, query: &RawQuery) -> Result<Vec<RawSample>> {
        if query.clauses.is_empty() || query.limit == 0 {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT d.resource_id, d.timestamp_micros, e.metric, e.value
             FROM raw_metric_entries e JOIN raw_metric_docs d ON d.id = e.doc_id
             WHERE e.value >= 0 AND (",
        );
        let mut clauses = qb.separated(" OR ");
        for clause in &query.clauses {
            clauses.push("(d.resource_id = ");
            clauses.push_bind_unseparated(&clause.resource_id);
            clauses.push_unseparated(" AND e.metric = ");
            clauses.push_bind_unseparated(&clause.metric);
            if let Some(since) = clause.since_micros {
                clauses.push_unseparated(" AND d.timestamp_micros >= ");
                clauses.push_bind_unseparated(since);
            }
            clauses.push_unseparated(")");
        }
        qb.push(")");
        qb.push(" ORDER BY d.timestamp_micros DESC, d.id DESC LIMIT ");
        qb.push_bind(query.limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawSample {
                resource_id: row.try_get("resource_id")?,
                metric: row.try_get("metric")?,
                value: row.try_get("value")?,
                source_micros: row.try_get("timestamp_micros")?,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(repo = "metrics", operation = "aggregates"))]
    async fn aggregates(
        &self,
        resource_id: &str,
        key: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AggregateRecord>> {
        let rows = match key {
            Some(key) => {
                sqlx::query(
                    "SELECT * FROM aggregate_records WHERE resource_id = $1 AND metric_key = $2
                     ORDER BY published_micros DESC, id DESC LIMIT $3",
                )
                .bind(resource_id)
                .bind(key)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM aggregate_records WHERE resource_id = $1
                     ORDER BY published_micros DESC, id DESC LIMIT $2",
                )
                .bind(resource_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::parse_aggregate_row).collect()
    }

    #[instrument(skip(self), fields(repo = "metrics", operation = "prune_expired"))]
    async fn prune_expired(&self, now_micros: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM raw_metric_entries WHERE doc_id IN (SELECT id FROM raw_metric_docs WHERE expires_at < $1)",
        )
        .bind(now_micros)
        .execute(&mut *tx)
        .await?;
        let docs = sqlx::query("DELETE FROM raw_metric_docs WHERE expires_at < $1")
            .bind(now_micros)
            .execute(&mut *tx)
            .await?;
        let aggregates = sqlx::query("DELETE FROM aggregate_records WHERE expires_at < $1")
            .bind(now_micros)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(docs.rows_affected() + aggregates.rows_affected())
    }
}
