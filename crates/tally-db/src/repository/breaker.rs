//! # Breaker Repository
//!
//! Persists named breaker rows. The rotation job owns exactly one,
//! `credential_rotation`; a missing row reads as closed.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{BreakerState, RotationBreakerState};

/// Repository for breaker state.
#[derive(Debug, Clone)]
pub struct BreakerRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct BreakerRow {
    state: BreakerState,
    failure_count: i64,
    resume_at: Option<DateTime<Utc>>,
}

impl TryFrom<BreakerRow> for RotationBreakerState {
    type Error = DbError;

    fn try_from(row: BreakerRow) -> DbResult<Self> {
        let failure_count = u32::try_from(row.failure_count)
            .map_err(|_| DbError::InvalidRow(format!("failure_count = {}", row.failure_count)))?;
        Ok(RotationBreakerState {
            state: row.state,
            failure_count,
            resume_at: row.resume_at,
        })
    }
}

impl BreakerRepository {
    /// Creates a new BreakerRepository.
    pub fn new(pool: SqlitePool) -> Self {
        BreakerRepository { pool }
    }

    /// Loads a breaker, closed if it was never saved.
    pub async fn load(&self, name: &str) -> DbResult<RotationBreakerState> {
        let row: Option<BreakerRow> = sqlx::query_as(
            r#"
            SELECT state, failure_count, resume_at
            FROM rotation_breaker
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => RotationBreakerState::try_from(row),
            None => Ok(RotationBreakerState::closed()),
        }
    }

    /// Saves a breaker.
    pub async fn save(
        &self,
        name: &str,
        state: &RotationBreakerState,
        now: DateTime<Utc>,
    ) -> DbResult<()> {
        debug!(
            name,
            state = %state.state,
            failure_count = state.failure_count,
            "Saving breaker"
        );

        sqlx::query(
            r#"
            INSERT INTO rotation_breaker (name, state, failure_count, resume_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (name) DO UPDATE SET
                state         = excluded.state,
                failure_count = excluded.failure_count,
                resume_at     = excluded.resume_at,
                updated_at    = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(state.state)
        .bind(i64::from(state.failure_count))
        .bind(state.resume_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_missing_breaker_is_closed() {
        let repo = Database::new(DbConfig::in_memory()).await.unwrap().breaker();
        assert_eq!(
            repo.load("credential_rotation").await.unwrap(),
            RotationBreakerState::closed()
        );
    }

    #[tokio::test]
    async fn test_save_and_load_open_breaker() {
        let repo = Database::new(DbConfig::in_memory()).await.unwrap().breaker();
        let resume_at = Utc::now() + chrono::Duration::hours(6);
        let open = RotationBreakerState {
            state: BreakerState::Open,
            failure_count: 10,
            resume_at: Some(resume_at),
        };
        repo.save("credential_rotation", &open, Utc::now())
            .await
            .unwrap();

        let loaded = repo.load("credential_rotation").await.unwrap();
        assert_eq!(loaded.state, BreakerState::Open);
        assert_eq!(loaded.failure_count, 10);
        assert_eq!(
            loaded.resume_at.map(|t| t.timestamp_millis()),
            Some(resume_at.timestamp_millis())
        );

        // Rows are independent per name
        assert_eq!(repo.load("other").await.unwrap().state, BreakerState::Closed);
    }
}
