use crate::import::run::ImportRunRepository;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub const STALE_RUN_MESSAGE: &str =
    "Import process was interrupted before the run finished";

/// Startup sweep: a crashed process leaves its run stuck in RUNNING,
/// and nothing else ever transitions it out. Runs younger than the
/// threshold are left alone — they may still be in progress elsewhere.
pub async fn fail_stale_runs(
    runs: &Arc<dyn ImportRunRepository>,
    stale_after: Duration,
) -> anyhow::Result<u64> {
    let cutoff = OffsetDateTime::now_utc() - stale_after;
    let failed = runs.fail_stale_running(cutoff, STALE_RUN_MESSAGE).await?;
    if failed > 0 {
        log::warn!("Marked {failed} stranded import run(s) as failed");
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::run::{RunStatus, SqliteImportRunRepository};
    use rusqlite::params;
    use tokio_rusqlite::Connection;

    #[tokio::test]
    async fn sweeps_only_runs_older_than_the_threshold() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo = SqliteImportRunRepository::init(conn.clone())
            .await
            .expect("init");
        let runs: Arc<dyn ImportRunRepository> = Arc::new(
            SqliteImportRunRepository::init(conn.clone())
                .await
                .expect("init"),
        );

        let stale = repo.create("old.csv", "/tmp/old.csv").await.expect("create");
        let fresh = repo.create("new.csv", "/tmp/new.csv").await.expect("create");
        repo.mark_running(stale.id).await.expect("mark running");
        repo.mark_running(fresh.id).await.expect("mark running");

        // Backdate: one run started 31 minutes ago, one 10 minutes ago.
        let (stale_id, fresh_id) = (stale.id, fresh.id);
        conn.call(move |conn| {
            conn.execute(
                "UPDATE import_run SET started_at = started_at - 1860 WHERE id = ?1",
                params![stale_id],
            )?;
            conn.execute(
                "UPDATE import_run SET started_at = started_at - 600 WHERE id = ?1",
                params![fresh_id],
            )?;
            Ok(())
        })
        .await
        .expect("backdate");

        let failed = fail_stale_runs(&runs, Duration::from_secs(30 * 60))
            .await
            .expect("sweep");
        assert_eq!(failed, 1);

        let stored = repo.get(stale.id).await.expect("get").expect("run");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some(STALE_RUN_MESSAGE));
        assert!(stored.finished_at.is_some());

        let untouched = repo.get(fresh.id).await.expect("get").expect("run");
        assert_eq!(untouched.status, RunStatus::Running);
    }
}
