//! # Credential Repository
//!
//! Sealed provider credentials, one row per (location, provider).
//!
//! Rows hold only the cipher bundle; plaintext never touches this crate.
//!
//! ## Compare-And-Swap
//! ```text
//! rotation job                               enroll (operator)
//! ────────────                               ─────────────────
//! read  row (version = 4)
//! refresh + validate new token ...           upsert → version = 5
//! swap(expected = 4)
//!   UPDATE ... WHERE version = 4   → 0 rows → DbError::StaleCredential
//! ```
//! A swap only lands if nobody touched the row since it was read, and it is
//! a single UPDATE, so a reader sees either the old bundle or the new one.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use tally_core::{CipherBundle, CredentialRecord};

/// Repository for sealed credentials.
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    location_id: String,
    provider: String,
    iv: String,
    tag: String,
    data: String,
    expires_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    rotated_at: Option<DateTime<Utc>>,
}

impl From<CredentialRow> for CredentialRecord {
    fn from(row: CredentialRow) -> Self {
        CredentialRecord {
            location_id: row.location_id,
            provider: row.provider,
            bundle: CipherBundle {
                iv: row.iv,
                tag: row.tag,
                data: row.data,
            },
            expires_at: row.expires_at,
            version: row.version,
            created_at: row.created_at,
            rotated_at: row.rotated_at,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT location_id, provider, iv, tag, data,
           expires_at, version, created_at, rotated_at
    FROM credentials
"#;

impl CredentialRepository {
    /// Creates a new CredentialRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CredentialRepository { pool }
    }

    /// Stores (or replaces) the credential for a pair.
    ///
    /// Replacing bumps `version`, so any rotation that read the old row
    /// loses its swap.
    ///
    /// ## Returns
    /// The new version.
    pub async fn upsert(
        &self,
        location_id: &str,
        provider: &str,
        bundle: &CipherBundle,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<i64> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO credentials (
                location_id, provider, iv, tag, data,
                expires_at, version, created_at, rotated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, NULL)
            ON CONFLICT (location_id, provider) DO UPDATE SET
                iv         = excluded.iv,
                tag        = excluded.tag,
                data       = excluded.data,
                expires_at = excluded.expires_at,
                version    = credentials.version + 1,
                created_at = excluded.created_at,
                rotated_at = NULL
            RETURNING version
            "#,
        )
        .bind(location_id)
        .bind(provider)
        .bind(&bundle.iv)
        .bind(&bundle.tag)
        .bind(&bundle.data)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(location_id, provider, version, "Stored credential");
        Ok(version)
    }

    /// Gets the credential for a pair.
    pub async fn get(&self, location_id: &str, provider: &str) -> DbResult<Option<CredentialRecord>> {
        let sql = format!("{} WHERE location_id = ?1 AND provider = ?2", SELECT_COLUMNS);
        let row: Option<CredentialRow> = sqlx::query_as(&sql)
            .bind(location_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(CredentialRecord::from))
    }

    /// Credentials that expire at or before `deadline`, soonest first.
    ///
    /// Credentials without an expiry never show up here.
    pub async fn list_due(&self, deadline: DateTime<Utc>) -> DbResult<Vec<CredentialRecord>> {
        let sql = format!("{} WHERE expires_at IS NOT NULL", SELECT_COLUMNS);
        let rows: Vec<CredentialRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        // Compared as instants, not as TEXT: stored offsets may differ.
        let mut due: Vec<CredentialRecord> = rows
            .into_iter()
            .map(CredentialRecord::from)
            .filter(|record| record.is_due(deadline))
            .collect();
        due.sort_by_key(|record| record.expires_at);

        debug!(count = due.len(), %deadline, "Loaded due credentials");
        Ok(due)
    }

    /// Replaces the bundle iff the row is still at `expected_version`.
    ///
    /// ## Errors
    /// * `DbError::StaleCredential` - the row changed (or vanished) since it
    ///   was read
    pub async fn swap(
        &self,
        location_id: &str,
        provider: &str,
        expected_version: i64,
        bundle: &CipherBundle,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DbResult<i64> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE credentials SET
                iv         = ?4,
                tag        = ?5,
                data       = ?6,
                expires_at = ?7,
                version    = version + 1,
                rotated_at = ?8
            WHERE location_id = ?1 AND provider = ?2 AND version = ?3
            RETURNING version
            "#,
        )
        .bind(location_id)
        .bind(provider)
        .bind(expected_version)
        .bind(&bundle.iv)
        .bind(&bundle.tag)
        .bind(&bundle.data)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match version {
            Some(version) => {
                info!(location_id, provider, version, "Swapped credential");
                Ok(version)
            }
            None => Err(DbError::StaleCredential {
                location_id: location_id.to_string(),
                provider: provider.to_string(),
            }),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn bundle(tag: &str) -> CipherBundle {
        CipherBundle {
            iv: "aXY=".into(),
            tag: tag.into(),
            data: "ZGF0YQ==".into(),
        }
    }

    async fn repo() -> CredentialRepository {
        Database::new(DbConfig::in_memory())
            .await
            .unwrap()
            .credentials()
    }

    #[tokio::test]
    async fn test_upsert_then_get() {
        let repo = repo().await;
        let version = repo
            .upsert("loc-1", "square", &bundle("t1"), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(version, 1);

        let stored = repo.get("loc-1", "square").await.unwrap().unwrap();
        assert_eq!(stored.bundle, bundle("t1"));
        assert_eq!(stored.version, 1);
        assert!(stored.rotated_at.is_none());
    }

    #[tokio::test]
    async fn test_reenroll_bumps_version() {
        let repo = repo().await;
        repo.upsert("loc-1", "square", &bundle("t1"), None, Utc::now())
            .await
            .unwrap();
        let version = repo
            .upsert("loc-1", "square", &bundle("t2"), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_swap_with_current_version() {
        let repo = repo().await;
        let v1 = repo
            .upsert("loc-1", "clover", &bundle("old"), None, Utc::now())
            .await
            .unwrap();

        let v2 = repo
            .swap("loc-1", "clover", v1, &bundle("new"), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(v2, v1 + 1);

        let stored = repo.get("loc-1", "clover").await.unwrap().unwrap();
        assert_eq!(stored.bundle.tag, "new");
        assert!(stored.rotated_at.is_some());
    }

    #[tokio::test]
    async fn test_swap_with_stale_version_leaves_row() {
        let repo = repo().await;
        let v1 = repo
            .upsert("loc-1", "clover", &bundle("old"), None, Utc::now())
            .await
            .unwrap();
        repo.upsert("loc-1", "clover", &bundle("reenrolled"), None, Utc::now())
            .await
            .unwrap();

        let err = repo
            .swap("loc-1", "clover", v1, &bundle("rotated"), None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::StaleCredential { .. }));

        let stored = repo.get("loc-1", "clover").await.unwrap().unwrap();
        assert_eq!(stored.bundle.tag, "reenrolled");
    }

    #[tokio::test]
    async fn test_list_due_filters_and_orders() {
        let repo = repo().await;
        let now = Utc::now();
        repo.upsert("a", "square", &bundle("a"), Some(now + chrono::Duration::hours(10)), now)
            .await
            .unwrap();
        repo.upsert("b", "square", &bundle("b"), Some(now + chrono::Duration::hours(2)), now)
            .await
            .unwrap();
        repo.upsert("c", "square", &bundle("c"), Some(now + chrono::Duration::days(30)), now)
            .await
            .unwrap();
        repo.upsert("d", "toast", &bundle("d"), None, now)
            .await
            .unwrap();

        let due = repo
            .list_due(now + chrono::Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(
            due.iter().map(|c| c.location_id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }
}
