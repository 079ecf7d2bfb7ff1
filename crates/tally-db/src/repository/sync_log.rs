//! # Sync Log Repository
//!
//! Sync runs and the per-(location, provider) gate status rows.
//!
//! ## Closing A Run
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   SINGLE TRANSACTION (close_run)                        │
//! │                                                                         │
//! │  1. UPDATE sync_runs SET status = ?, ended_at = ?, ...                 │
//! │     WHERE run_id = ? AND status = 'running'                            │
//! │     RETURNING location_id, provider                                    │
//! │        └── no row? → DbError::RunNotOpen (closed twice / unknown)      │
//! │                                                                         │
//! │  2. SELECT * FROM sync_status WHERE (location_id, provider) = ...      │
//! │        └── missing? → SyncStatus::new(...)                             │
//! │                                                                         │
//! │  3. next = transition(current)     ← caller-supplied, pure             │
//! │                                                                         │
//! │  4. INSERT INTO sync_status ... ON CONFLICT DO UPDATE                  │
//! │                                                                         │
//! │  COMMIT ← run row and gate row change together or not at all           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The repository does not know the gate's rules. The transition is passed
//! in (see `tally_core::gate`), which keeps the read-modify-write here and
//! the policy in the pure crate.

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{SyncRun, SyncRunState, SyncStatus};

/// Repository for sync runs and gate status.
#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunClose {
    pub status: SyncRunState,
    pub count: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
}

impl RunClose {
    pub fn success(count: i64, duration_ms: i64) -> Self {
        RunClose {
            status: SyncRunState::Success,
            count,
            duration_ms,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>, duration_ms: i64) -> Self {
        RunClose {
            status: SyncRunState::Error,
            count: 0,
            duration_ms,
            error: Some(message.into()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    location_id: String,
    provider: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    status: SyncRunState,
    count: i64,
    duration_ms: Option<i64>,
    error: Option<String>,
}

impl From<RunRow> for SyncRun {
    fn from(row: RunRow) -> Self {
        SyncRun {
            run_id: row.run_id,
            location_id: row.location_id,
            provider: row.provider,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status: row.status,
            count: row.count,
            duration_ms: row.duration_ms,
            error: row.error,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    location_id: String,
    provider: String,
    failures: i64,
    next_attempt_at: Option<DateTime<Utc>>,
    paused_until: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<StatusRow> for SyncStatus {
    type Error = DbError;

    fn try_from(row: StatusRow) -> DbResult<Self> {
        let failures = u32::try_from(row.failures)
            .map_err(|_| DbError::InvalidRow(format!("failures = {}", row.failures)))?;
        Ok(SyncStatus {
            location_id: row.location_id,
            provider: row.provider,
            failures,
            next_attempt_at: row.next_attempt_at,
            paused_until: row.paused_until,
            last_run_at: row.last_run_at,
            last_error: row.last_error,
        })
    }
}

const SELECT_RUN: &str = r#"
    SELECT run_id, location_id, provider, started_at, ended_at,
           status, count, duration_ms, error
    FROM sync_runs
"#;

const SELECT_STATUS: &str = r#"
    SELECT location_id, provider, failures, next_attempt_at,
           paused_until, last_run_at, last_error
    FROM sync_status
    WHERE location_id = ?1 AND provider = ?2
"#;

impl SyncLogRepository {
    /// Creates a new SyncLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Opens a new running run and returns it.
    pub async fn start_run(
        &self,
        location_id: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> DbResult<SyncRun> {
        let run = SyncRun {
            run_id: Uuid::new_v4().to_string(),
            location_id: location_id.to_string(),
            provider: provider.to_string(),
            started_at: now,
            ended_at: None,
            status: SyncRunState::Running,
            count: 0,
            duration_ms: None,
            error: None,
        };

        debug!(run_id = %run.run_id, location_id, provider, "Opening sync run");

        sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, location_id, provider, started_at, status, count)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            "#,
        )
        .bind(&run.run_id)
        .bind(&run.location_id)
        .bind(&run.provider)
        .bind(run.started_at)
        .bind(run.status)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    /// Closes a running run and applies `transition` to its gate row, in one
    /// transaction.
    ///
    /// ## Errors
    /// * `DbError::RunNotOpen` - unknown run, or already closed
    pub async fn close_run<F>(
        &self,
        run_id: &str,
        close: &RunClose,
        now: DateTime<Utc>,
        transition: F,
    ) -> DbResult<SyncStatus>
    where
        F: FnOnce(&SyncStatus) -> SyncStatus,
    {
        let mut tx = self.pool.begin().await?;

        let pair: Option<(String, String)> = sqlx::query_as(
            r#"
            UPDATE sync_runs SET
                status = ?2,
                ended_at = ?3,
                count = ?4,
                duration_ms = ?5,
                error = ?6
            WHERE run_id = ?1 AND status = 'running'
            RETURNING location_id, provider
            "#,
        )
        .bind(run_id)
        .bind(close.status)
        .bind(now)
        .bind(close.count)
        .bind(close.duration_ms)
        .bind(&close.error)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((location_id, provider)) = pair else {
            return Err(DbError::RunNotOpen {
                run_id: run_id.to_string(),
            });
        };

        let current = Self::read_status(&mut tx, &location_id, &provider)
            .await?
            .unwrap_or_else(|| SyncStatus::new(&location_id, &provider));
        let next = transition(&current);
        Self::write_status(&mut tx, &next, now).await?;

        tx.commit().await?;

        debug!(
            run_id,
            status = %close.status,
            failures = next.failures,
            "Closed sync run"
        );
        Ok(next)
    }

    /// Gets one run.
    pub async fn get_run(&self, run_id: &str) -> DbResult<Option<SyncRun>> {
        let sql = format!("{} WHERE run_id = ?1", SELECT_RUN);
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SyncRun::from))
    }

    /// Most recent runs for a pair, newest first.
    pub async fn recent_runs(
        &self,
        location_id: &str,
        provider: &str,
        limit: u32,
    ) -> DbResult<Vec<SyncRun>> {
        let sql = format!(
            "{} WHERE location_id = ?1 AND provider = ?2 ORDER BY started_at DESC LIMIT ?3",
            SELECT_RUN
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql)
            .bind(location_id)
            .bind(provider)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SyncRun::from).collect())
    }

    // =========================================================================
    // Gate Status
    // =========================================================================

    /// Gets the gate row for a pair, if it was ever written.
    pub async fn get_status(
        &self,
        location_id: &str,
        provider: &str,
    ) -> DbResult<Option<SyncStatus>> {
        let row: Option<StatusRow> = sqlx::query_as(SELECT_STATUS)
            .bind(location_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SyncStatus::try_from).transpose()
    }

    /// Writes a gate row as-is.
    ///
    /// Used by operators clearing a pause and by tests seeding state; the
    /// sync path only changes status through [`Self::close_run`].
    pub async fn put_status(&self, status: &SyncStatus, now: DateTime<Utc>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_status(&mut tx, status, now).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_status(
        tx: &mut Transaction<'_, Sqlite>,
        location_id: &str,
        provider: &str,
    ) -> DbResult<Option<SyncStatus>> {
        let row: Option<StatusRow> = sqlx::query_as(SELECT_STATUS)
            .bind(location_id)
            .bind(provider)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(SyncStatus::try_from).transpose()
    }

    async fn write_status(
        tx: &mut Transaction<'_, Sqlite>,
        status: &SyncStatus,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_status (
                location_id, provider, failures, next_attempt_at,
                paused_until, last_run_at, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (location_id, provider) DO UPDATE SET
                failures        = excluded.failures,
                next_attempt_at = excluded.next_attempt_at,
                paused_until    = excluded.paused_until,
                last_run_at     = excluded.last_run_at,
                last_error      = excluded.last_error,
                updated_at      = excluded.updated_at
            "#,
        )
        .bind(&status.location_id)
        .bind(&status.provider)
        .bind(i64::from(status.failures))
        .bind(status.next_attempt_at)
        .bind(status.paused_until)
        .bind(status.last_run_at)
        .bind(&status.last_error)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    async fn repo() -> SyncLogRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().sync_log()
    }

    fn bump(status: &SyncStatus) -> SyncStatus {
        SyncStatus {
            failures: status.failures + 1,
            last_error: Some("boom".into()),
            ..status.clone()
        }
    }

    #[tokio::test]
    async fn test_start_run_is_running() {
        let repo = repo().await;
        let run = repo.start_run("loc-1", "square", Utc::now()).await.unwrap();

        let stored = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunState::Running);
        assert!(stored.ended_at.is_none());
        assert!(repo.get_status("loc-1", "square").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_run_updates_run_and_status_together() {
        let repo = repo().await;
        let run = repo.start_run("loc-1", "square", Utc::now()).await.unwrap();

        let status = repo
            .close_run(&run.run_id, &RunClose::error("boom", 120), Utc::now(), bump)
            .await
            .unwrap();
        assert_eq!(status.failures, 1);

        let stored_run = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored_run.status, SyncRunState::Error);
        assert_eq!(stored_run.duration_ms, Some(120));
        assert_eq!(stored_run.error.as_deref(), Some("boom"));

        let stored_status = repo.get_status("loc-1", "square").await.unwrap().unwrap();
        assert_eq!(stored_status, status);
    }

    #[tokio::test]
    async fn test_run_closes_exactly_once() {
        let repo = repo().await;
        let run = repo.start_run("loc-1", "square", Utc::now()).await.unwrap();

        repo.close_run(&run.run_id, &RunClose::success(5, 10), Utc::now(), |s| s.clone())
            .await
            .unwrap();

        let err = repo
            .close_run(&run.run_id, &RunClose::error("late", 10), Utc::now(), bump)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::RunNotOpen { .. }));

        // The rejected close changed nothing
        let stored = repo.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunState::Success);
        assert_eq!(stored.count, 5);
        let status = repo.get_status("loc-1", "square").await.unwrap().unwrap();
        assert_eq!(status.failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_open() {
        let repo = repo().await;
        let err = repo
            .close_run("nope", &RunClose::success(0, 0), Utc::now(), |s| s.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::RunNotOpen { .. }));
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let repo = repo().await;
        let t0 = Utc::now();
        let first = repo.start_run("loc-1", "toast", t0).await.unwrap();
        let second = repo
            .start_run("loc-1", "toast", t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();
        repo.start_run("loc-2", "toast", t0).await.unwrap();

        let runs = repo.recent_runs("loc-1", "toast", 10).await.unwrap();
        assert_eq!(
            runs.iter().map(|r| r.run_id.clone()).collect::<Vec<_>>(),
            vec![second.run_id, first.run_id]
        );
    }

    #[tokio::test]
    async fn test_put_status_round_trips() {
        let repo = repo().await;
        let mut status = SyncStatus::new("loc-1", "clover");
        status.failures = 3;
        status.next_attempt_at = Some(Utc::now());
        repo.put_status(&status, Utc::now()).await.unwrap();

        let stored = repo.get_status("loc-1", "clover").await.unwrap().unwrap();
        assert_eq!(stored.failures, 3);
        assert_eq!(
            stored.next_attempt_at.map(|t| t.timestamp_millis()),
            status.next_attempt_at.map(|t| t.timestamp_millis())
        );
    }
}
