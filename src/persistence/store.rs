//! SQLite-based persistence store

use crate::core::{ExecutionRecord, ExecutionStatus, LogEntry, PipelineStats};
use crate::execution::StatsStore;
use crate::persistence::{apply_finish, ExecutionStore, ExecutionUpdate, FinishExecution, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

const SELECT_EXECUTION: &str = r#"
    SELECT id, pipeline_id, triggered_by, status, start_time, end_time, duration_ms,
           input_snapshot, output_snapshot, logs, stats, error
    FROM executions
"#;

/// SQLite execution store; also keeps per-pipeline rolling stats
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a new SQLite store (`":memory:"` for a private in-memory database)
    pub async fn new(db_path: &str) -> Result<Self> {
        let in_memory = db_path == ":memory:";
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))
            .context("Invalid database path")?
            .create_if_missing(true);

        // Every connection to :memory: is a separate database, so pin one
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Open a database file, creating its directory if needed
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Self::new(&path.to_string_lossy()).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                triggered_by TEXT,
                status TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_ms INTEGER,
                input_snapshot TEXT NOT NULL,
                output_snapshot TEXT,
                logs TEXT NOT NULL DEFAULT '[]',
                stats TEXT NOT NULL DEFAULT '{}',
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_executions_pipeline ON executions(pipeline_id, start_time);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

            CREATE TABLE IF NOT EXISTS pipeline_stats (
                pipeline_id TEXT PRIMARY KEY,
                execution_count INTEGER NOT NULL DEFAULT 0,
                total_processed_rows INTEGER NOT NULL DEFAULT 0,
                average_execution_time REAL NOT NULL DEFAULT 0.0
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize schema")?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn record_from_row(row: &SqliteRow) -> Result<ExecutionRecord> {
        let status: String = row.try_get("status")?;
        let output: Option<String> = row.try_get("output_snapshot")?;

        Ok(ExecutionRecord {
            id: Uuid::parse_str(&row.try_get::<String, _>("id")?)?,
            pipeline_id: row.try_get("pipeline_id")?,
            triggered_by: row.try_get("triggered_by")?,
            status: ExecutionStatus::parse(&status)
                .with_context(|| format!("Unknown execution status '{}'", status))?,
            start_time: Self::from_naive(row.try_get("start_time")?),
            end_time: row
                .try_get::<Option<NaiveDateTime>, _>("end_time")?
                .map(Self::from_naive),
            duration_ms: row.try_get::<Option<i64>, _>("duration_ms")?.map(|d| d as u64),
            input_snapshot: serde_json::from_str(&row.try_get::<String, _>("input_snapshot")?)?,
            output_snapshot: output.map(|s| serde_json::from_str::<Value>(&s)).transpose()?,
            logs: serde_json::from_str(&row.try_get::<String, _>("logs")?)?,
            stats: serde_json::from_str(&row.try_get::<String, _>("stats")?)?,
            error: row.try_get("error")?,
        })
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(&format!("{} WHERE id = ?1", SELECT_EXECUTION))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        row.as_ref().map(Self::record_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create(
        &self,
        pipeline_id: &str,
        triggered_by: Option<String>,
        input_snapshot: Value,
    ) -> Result<ExecutionRecord, StoreError> {
        let record = ExecutionRecord::started(pipeline_id, triggered_by, input_snapshot);

        sqlx::query(
            r#"
            INSERT INTO executions
            (id, pipeline_id, triggered_by, status, start_time, input_snapshot, logs, stats)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.pipeline_id)
        .bind(&record.triggered_by)
        .bind(record.status.as_str())
        .bind(Self::to_naive(record.start_time))
        .bind(serde_json::to_string(&record.input_snapshot).context("Failed to encode input")?)
        .bind("[]")
        .bind(serde_json::to_string(&record.stats).context("Failed to encode stats")?)
        .execute(&self.pool)
        .await
        .context("Failed to create execution")?;

        Ok(record)
    }

    async fn update(&self, id: Uuid, update: ExecutionUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let row = sqlx::query("SELECT logs, end_time FROM executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to load execution")?
            .ok_or(StoreError::NotFound(id))?;

        let end_time: Option<NaiveDateTime> = row.try_get("end_time").context("Bad end_time column")?;
        if end_time.is_some() {
            return Err(StoreError::AlreadyFinished(id));
        }

        let mut logs: Vec<LogEntry> = serde_json::from_str(
            &row.try_get::<String, _>("logs").context("Bad logs column")?,
        )
        .context("Failed to decode logs")?;
        logs.extend(update.append_logs);

        sqlx::query("UPDATE executions SET logs = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(&logs).context("Failed to encode logs")?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to append logs")?;

        if let Some(stats) = update.stats {
            sqlx::query("UPDATE executions SET stats = ?1 WHERE id = ?2")
                .bind(serde_json::to_string(&stats).context("Failed to encode stats")?)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to update stats")?;
        }

        tx.commit().await.context("Failed to commit update")?;
        Ok(())
    }

    async fn finish(&self, id: Uuid, finish: FinishExecution) -> Result<ExecutionRecord, StoreError> {
        let mut record = self.fetch(id).await?.ok_or(StoreError::NotFound(id))?;
        apply_finish(&mut record, finish)?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?1, end_time = ?2, duration_ms = ?3, output_snapshot = ?4,
                logs = ?5, stats = ?6, error = ?7
            WHERE id = ?8 AND end_time IS NULL
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.end_time.map(Self::to_naive))
        .bind(record.duration_ms.map(|d| d as i64))
        .bind(
            record
                .output_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("Failed to encode output")?,
        )
        .bind(serde_json::to_string(&record.logs).context("Failed to encode logs")?)
        .bind(serde_json::to_string(&record.stats).context("Failed to encode stats")?)
        .bind(&record.error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to finish execution")?;

        // Lost a race with another finisher
        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyFinished(id));
        }

        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.fetch(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, pipeline_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} WHERE pipeline_id = ?1 ORDER BY start_time DESC, rowid DESC",
            SELECT_EXECUTION
        ))
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list executions")?;

        Ok(rows
            .iter()
            .map(Self::record_from_row)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn list_running(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'running' ORDER BY start_time ASC",
            SELECT_EXECUTION
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list running executions")?;

        Ok(rows
            .iter()
            .map(Self::record_from_row)
            .collect::<Result<Vec<_>>>()?)
    }
}

#[async_trait::async_trait]
impl StatsStore for SqliteExecutionStore {
    async fn record_run(
        &self,
        pipeline_id: &str,
        baseline: PipelineStats,
        duration_ms: u64,
        processed_rows: u64,
    ) -> Result<PipelineStats> {
        // One statement, so concurrent finishes serialize inside SQLite.
        // A first run folds into the definition's baseline.
        let row = sqlx::query(
            r#"
            INSERT INTO pipeline_stats (pipeline_id, execution_count, total_processed_rows, average_execution_time)
            VALUES (?1, ?4 + 1, ?5 + ?2, (?6 * ?4 + ?3) / (?4 + 1))
            ON CONFLICT(pipeline_id) DO UPDATE SET
                execution_count = execution_count + 1,
                total_processed_rows = total_processed_rows + ?2,
                average_execution_time =
                    (average_execution_time * execution_count + ?3)
                    / (execution_count + 1)
            RETURNING execution_count, total_processed_rows, average_execution_time
            "#,
        )
        .bind(pipeline_id)
        .bind(processed_rows as i64)
        .bind(duration_ms as f64)
        .bind(baseline.execution_count as i64)
        .bind(baseline.total_processed_rows as i64)
        .bind(baseline.average_execution_time)
        .fetch_one(&self.pool)
        .await
        .context("Failed to record pipeline stats")?;

        Ok(PipelineStats {
            execution_count: row.try_get::<i64, _>("execution_count")? as u64,
            total_processed_rows: row.try_get::<i64, _>("total_processed_rows")? as u64,
            average_execution_time: row.try_get("average_execution_time")?,
        })
    }

    async fn stats(&self, pipeline_id: &str) -> Result<PipelineStats> {
        let row = sqlx::query(
            r#"
            SELECT execution_count, total_processed_rows, average_execution_time
            FROM pipeline_stats
            WHERE pipeline_id = ?1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load pipeline stats")?;

        match row {
            Some(row) => Ok(PipelineStats {
                execution_count: row.try_get::<i64, _>("execution_count")? as u64,
                total_processed_rows: row.try_get::<i64, _>("total_processed_rows")? as u64,
                average_execution_time: row.try_get("average_execution_time")?,
            }),
            None => Ok(PipelineStats::default()),
        }
    }
}
