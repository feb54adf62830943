use crate::import::normalize::RowValidationError;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rusqlite::{params, Transaction, TransactionBehavior};
use serde::Serialize;
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "running" => RunStatus::Running,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub original_filename: String,
    pub file_path: String,
    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub total_rows: i64,
    pub inserted: i64,
    pub updated: i64,
    pub deactivated: i64,
    pub error_count: i64,
    pub last_error: Option<String>,
}

/// Final counts recorded on a successful run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub total_rows: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deactivated: u64,
    pub error_count: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ImportRowError {
    pub import_run_id: Uuid,
    pub row_number: i64,
    pub field: Option<String>,
    pub message: String,
}

/// A row error not yet tied to a run record.
#[derive(Clone, Debug)]
pub struct NewRowError {
    pub row_number: i64,
    pub field: Option<String>,
    pub message: String,
}

impl From<RowValidationError> for NewRowError {
    fn from(err: RowValidationError) -> Self {
        Self {
            row_number: err.row_number as i64,
            field: Some(err.field),
            message: err.message,
        }
    }
}

#[async_trait]
pub trait ImportRunRepository: Send + Sync {
    async fn create(&self, original_filename: &str, file_path: &str) -> anyhow::Result<ImportRun>;
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<ImportRun>>;
    async fn list(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<ImportRun>>;
    async fn next_queued(&self) -> anyhow::Result<Option<ImportRun>>;
    async fn mark_running(&self, id: Uuid) -> anyhow::Result<()>;
    async fn mark_succeeded(&self, id: Uuid, stats: ImportStats) -> anyhow::Result<()>;
    async fn mark_failed(&self, id: Uuid, message: &str) -> anyhow::Result<()>;
    /// Operator action: forces a run to FAILED only while it is still
    /// queued or running. Returns whether a transition happened.
    async fn mark_failed_if_unfinished(&self, id: Uuid, message: &str) -> anyhow::Result<bool>;
    async fn add_row_errors(&self, run_id: Uuid, errors: &[NewRowError]) -> anyhow::Result<()>;
    async fn list_row_errors(
        &self,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ImportRowError>>;
    /// Fails every RUNNING run whose start timestamp is older than
    /// `cutoff`. Returns the number of runs transitioned.
    async fn fail_stale_running(
        &self,
        cutoff: OffsetDateTime,
        message: &str,
    ) -> anyhow::Result<u64>;
}

pub struct SqliteImportRunRepository {
    conn: Connection,
}

const RUN_COLUMNS: &str = "id, status, original_filename, file_path, created_at, started_at,
     finished_at, total_rows, inserted, updated, deactivated, error_count, last_error";

fn from_ts(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportRun> {
    let status: String = row.get(1)?;
    let created_at: i64 = row.get(4)?;
    let started_at: Option<i64> = row.get(5)?;
    let finished_at: Option<i64> = row.get(6)?;
    Ok(ImportRun {
        id: row.get(0)?,
        status: RunStatus::from_str(&status),
        original_filename: row.get(2)?,
        file_path: row.get(3)?,
        created_at: from_ts(created_at),
        started_at: started_at.map(from_ts),
        finished_at: finished_at.map(from_ts),
        total_rows: row.get(7)?,
        inserted: row.get(8)?,
        updated: row.get(9)?,
        deactivated: row.get(10)?,
        error_count: row.get(11)?,
        last_error: row.get(12)?,
    })
}

impl SqliteImportRunRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", &"WAL");
            let _ = conn.pragma_update(None, "busy_timeout", &5000i64);
            conn.execute(
                "CREATE TABLE IF NOT EXISTS import_run (
                    id BLOB PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'queued',
                    original_filename TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    finished_at INTEGER,
                    total_rows INTEGER NOT NULL DEFAULT 0,
                    inserted INTEGER NOT NULL DEFAULT 0,
                    updated INTEGER NOT NULL DEFAULT 0,
                    deactivated INTEGER NOT NULL DEFAULT 0,
                    error_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS import_row_error (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    import_run_id BLOB NOT NULL,
                    row_number INTEGER NOT NULL,
                    field TEXT,
                    message TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_import_row_error_run
                 ON import_row_error (import_run_id, row_number)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ImportRunRepository for SqliteImportRunRepository {
    async fn create(&self, original_filename: &str, file_path: &str) -> anyhow::Result<ImportRun> {
        let run = ImportRun {
            id: Uuid::new_v4(),
            status: RunStatus::Queued,
            original_filename: original_filename.to_string(),
            file_path: file_path.to_string(),
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            finished_at: None,
            total_rows: 0,
            inserted: 0,
            updated: 0,
            deactivated: 0,
            error_count: 0,
            last_error: None,
        };
        let stored = run.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO import_run (id, status, original_filename, file_path, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        stored.id,
                        stored.status.as_str(),
                        stored.original_filename,
                        stored.file_path,
                        stored.created_at.unix_timestamp(),
                    ],
                )?;
                Ok(())
            })
            .await
            .context("Unable to create import run")?;
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<ImportRun>> {
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM import_run WHERE id = ?1"))?;
                let run = stmt.query_map([id], row_to_run)?.next().transpose()?;
                Ok(run)
            })
            .await
            .context("Unable to get import run")
    }

    async fn list(&self, limit: i64, offset: i64) -> anyhow::Result<Vec<ImportRun>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM import_run
                     ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2"
                ))?;
                let runs = stmt
                    .query_map(params![limit, offset], row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(runs)
            })
            .await
            .context("Unable to list import runs")
    }

    async fn next_queued(&self) -> anyhow::Result<Option<ImportRun>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM import_run
                     WHERE status = 'queued' ORDER BY created_at ASC, id LIMIT 1"
                ))?;
                let run = stmt.query_map([], row_to_run)?.next().transpose()?;
                Ok(run)
            })
            .await
            .context("Unable to find queued import run")
    }

    async fn mark_running(&self, id: Uuid) -> anyhow::Result<()> {
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE import_run SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND status = 'queued'",
                    params![id, OffsetDateTime::now_utc().unix_timestamp()],
                )?;
                Ok(changed)
            })
            .await
            .context("Unable to mark import run running")?;
        if changed == 0 {
            return Err(anyhow!("Import run {id} is not queued"));
        }
        Ok(())
    }

    async fn mark_succeeded(&self, id: Uuid, stats: ImportStats) -> anyhow::Result<()> {
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE import_run SET status = 'succeeded', finished_at = ?2,
                        total_rows = ?3, inserted = ?4, updated = ?5, deactivated = ?6,
                        error_count = ?7
                     WHERE id = ?1 AND status = 'running'",
                    params![
                        id,
                        OffsetDateTime::now_utc().unix_timestamp(),
                        stats.total_rows as i64,
                        stats.inserted as i64,
                        stats.updated as i64,
                        stats.deactivated as i64,
                        stats.error_count as i64,
                    ],
                )?;
                Ok(changed)
            })
            .await
            .context("Unable to mark import run succeeded")?;
        if changed == 0 {
            return Err(anyhow!("Import run {id} is not running"));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> anyhow::Result<()> {
        self.mark_failed_if_unfinished(id, message).await?;
        Ok(())
    }

    async fn mark_failed_if_unfinished(&self, id: Uuid, message: &str) -> anyhow::Result<bool> {
        let message = message.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE import_run SET status = 'failed', last_error = ?2, finished_at = ?3
                     WHERE id = ?1 AND status IN ('queued', 'running')",
                    params![id, message, OffsetDateTime::now_utc().unix_timestamp()],
                )?;
                Ok(changed)
            })
            .await
            .context("Unable to mark import run failed")?;
        Ok(changed > 0)
    }

    async fn add_row_errors(&self, run_id: Uuid, errors: &[NewRowError]) -> anyhow::Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let errors = errors.to_vec();
        self.conn
            .call(move |conn| {
                let tx = Transaction::new(conn, TransactionBehavior::Deferred)?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO import_row_error
                            (import_run_id, row_number, field, message, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    for e in errors {
                        stmt.execute(params![run_id, e.row_number, e.field, e.message, now])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .context("Unable to record import row errors")
    }

    async fn list_row_errors(
        &self,
        run_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ImportRowError>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT import_run_id, row_number, field, message FROM import_row_error
                     WHERE import_run_id = ?1 ORDER BY row_number, id LIMIT ?2 OFFSET ?3",
                )?;
                let errors = stmt
                    .query_map(params![run_id, limit, offset], |row| {
                        Ok(ImportRowError {
                            import_run_id: row.get(0)?,
                            row_number: row.get(1)?,
                            field: row.get(2)?,
                            message: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(errors)
            })
            .await
            .context("Unable to list import row errors")
    }

    async fn fail_stale_running(
        &self,
        cutoff: OffsetDateTime,
        message: &str,
    ) -> anyhow::Result<u64> {
        let message = message.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE import_run SET status = 'failed', last_error = ?1, finished_at = ?2
                     WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?3",
                    params![
                        message,
                        OffsetDateTime::now_utc().unix_timestamp(),
                        cutoff.unix_timestamp(),
                    ],
                )?;
                Ok(changed as u64)
            })
            .await
            .context("Unable to fail stale import runs")
    }
}
