// Task journal: one row per running task, rewritten on every stage transition.

use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use tracing::instrument;

use super::blob;
use crate::error::Result;
use crate::models::TaskRecord;

#[derive(Clone)]
pub struct TaskJournal {
    pool: SqlitePool,
}

impl TaskJournal {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(super) async fn init_table(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_states (
                task_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                data BLOB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Insert or replace the task's current `{stage, state}`.
    #[instrument(skip(self, record), fields(repo = "journal", operation = "record", task_id = %record.task_id, stage = %record.stage))]
    pub async fn record(&self, record: &TaskRecord) -> Result<()> {
        let data = blob::encode_task_record(record)?;
        sqlx::query(
            "INSERT OR REPLACE INTO task_states (task_id, kind, expires_at, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.task_id)
        .bind(record.kind.as_str())
        .bind(record.expires_micros)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "journal", operation = "remove"))]
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_states WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Running tasks ordered by task id. Rows with an unreadable blob are skipped.
    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT task_id, data FROM task_states ORDER BY task_id ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Vec<u8> = row.try_get("data")?;
            match blob::decode_task_record(&data) {
                Ok(record) => out.push(record),
                Err(e) => {
                    let task_id: String = row.try_get("task_id")?;
                    tracing::warn!(error = %e, task_id = %task_id, "skipping unreadable task record");
                }
            }
        }
        Ok(out)
    }

    /// Drop journal rows left behind by tasks that expired (crash or abandoned run).
    #[instrument(skip(self), fields(repo = "journal", operation = "purge_expired"))]
    pub async fn purge_expired(&self, now_micros: i64) -> Result<u64> {
        let r = sqlx::query("DELETE FROM task_states WHERE expires_at < $1")
            .bind(now_micros)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}
