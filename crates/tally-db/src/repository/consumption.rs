//! # Consumption Repository
//!
//! Stores one consumption snapshot per `(location_id, provider, date)`.
//!
//! ## Idempotent Upsert
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  INSERT INTO consumption (...) VALUES (...)                             │
//! │  ON CONFLICT (location_id, provider, date) DO UPDATE SET                │
//! │      total_cents = excluded.total_cents, ...   ← REPLACE, never add     │
//! │  WHERE consumption.client_id = excluded.client_id                       │
//! │  RETURNING id                                                           │
//! │                                                                         │
//! │  new key              → row inserted, new id returned                   │
//! │  same key, same owner → row replaced, SAME id returned                  │
//! │  same key, other owner→ no row returned → DbError::Forbidden            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ownership is checked and the write performed in one statement, so there
//! is no window between "who owns this row?" and "overwrite it".

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use tally_core::{ConsumptionInput, ConsumptionRecord, DateRange, Money, UpsertReceipt};

/// Repository for consumption snapshots.
#[derive(Debug, Clone)]
pub struct ConsumptionRepository {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ConsumptionRow {
    id: String,
    client_id: String,
    location_id: String,
    provider: String,
    date: NaiveDate,
    total_cents: i64,
    orders: i64,
    items: f64,
    discounts_cents: i64,
    taxes_cents: i64,
    meta: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ConsumptionRow> for ConsumptionRecord {
    type Error = DbError;

    fn try_from(row: ConsumptionRow) -> DbResult<Self> {
        Ok(ConsumptionRecord {
            id: row.id,
            client_id: row.client_id,
            location_id: row.location_id,
            provider: row.provider,
            date: row.date,
            total: Money::from_cents(row.total_cents),
            orders: row.orders,
            items: row.items,
            discounts: Money::from_cents(row.discounts_cents),
            taxes: Money::from_cents(row.taxes_cents),
            meta: serde_json::from_str(&row.meta)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, client_id, location_id, provider, date,
           total_cents, orders, items, discounts_cents, taxes_cents,
           meta, created_at, updated_at
    FROM consumption
"#;

impl ConsumptionRepository {
    /// Creates a new ConsumptionRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ConsumptionRepository { pool }
    }

    /// Inserts or replaces the snapshot for the input's key.
    ///
    /// ## Returns
    /// * `Ok(UpsertReceipt)` - the row id, stable across re-upserts
    /// * `Err(DbError::Forbidden)` - the key belongs to another client
    pub async fn upsert(&self, input: &ConsumptionInput) -> DbResult<UpsertReceipt> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let meta = serde_json::to_string(&input.meta)?;

        debug!(
            client_id = %input.client_id,
            location_id = %input.location_id,
            provider = %input.provider,
            date = %input.date,
            orders = input.orders,
            "Upserting consumption snapshot"
        );

        let returned: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO consumption (
                id, client_id, location_id, provider, date,
                total_cents, orders, items, discounts_cents, taxes_cents,
                meta, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?12
            )
            ON CONFLICT (location_id, provider, date) DO UPDATE SET
                total_cents     = excluded.total_cents,
                orders          = excluded.orders,
                items           = excluded.items,
                discounts_cents = excluded.discounts_cents,
                taxes_cents     = excluded.taxes_cents,
                meta            = excluded.meta,
                updated_at      = excluded.updated_at
            WHERE consumption.client_id = excluded.client_id
            RETURNING id
            "#,
        )
        .bind(&id)
        .bind(&input.client_id)
        .bind(&input.location_id)
        .bind(&input.provider)
        .bind(input.date)
        .bind(input.total.cents())
        .bind(input.orders)
        .bind(input.items)
        .bind(input.discounts.cents())
        .bind(input.taxes.cents())
        .bind(&meta)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match returned {
            Some(id) => Ok(UpsertReceipt { id }),
            None => {
                warn!(
                    client_id = %input.client_id,
                    location_id = %input.location_id,
                    provider = %input.provider,
                    date = %input.date,
                    "Consumption key owned by another client"
                );
                Err(DbError::Forbidden)
            }
        }
    }

    /// Gets the snapshot for one key.
    pub async fn get(
        &self,
        location_id: &str,
        provider: &str,
        date: NaiveDate,
    ) -> DbResult<Option<ConsumptionRecord>> {
        let sql = format!(
            "{} WHERE location_id = ?1 AND provider = ?2 AND date = ?3",
            SELECT_COLUMNS
        );
        let row: Option<ConsumptionRow> = sqlx::query_as(&sql)
            .bind(location_id)
            .bind(provider)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;

        row.map(ConsumptionRecord::try_from).transpose()
    }

    /// Lists a location's snapshots inside `range`, oldest first.
    ///
    /// `provider = None` returns every provider for the location.
    pub async fn list_for_location(
        &self,
        location_id: &str,
        provider: Option<&str>,
        range: &DateRange,
    ) -> DbResult<Vec<ConsumptionRecord>> {
        let sql = format!(
            "{} WHERE location_id = ?1
                AND (?2 IS NULL OR provider = ?2)
                AND date >= ?3 AND date <= ?4
              ORDER BY date ASC, provider ASC",
            SELECT_COLUMNS
        );
        let rows: Vec<ConsumptionRow> = sqlx::query_as(&sql)
            .bind(location_id)
            .bind(provider)
            .bind(range.from)
            .bind(range.to)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ConsumptionRecord::try_from).collect()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn input(client: &str, total: i64) -> ConsumptionInput {
        ConsumptionInput {
            client_id: client.to_string(),
            location_id: "loc-1".to_string(),
            provider: "square".to_string(),
            date: day(1),
            total: Money::from_cents(total),
            orders: 3,
            items: 4.5,
            discounts: Money::from_cents(25),
            taxes: Money::from_cents(80),
            meta: json!({ "provider": "square" }),
        }
    }

    async fn repo() -> ConsumptionRepository {
        Database::new(DbConfig::in_memory())
            .await
            .unwrap()
            .consumption()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_reads_back() {
        let repo = repo().await;
        let receipt = repo.upsert(&input("client-1", 1500)).await.unwrap();

        let stored = repo.get("loc-1", "square", day(1)).await.unwrap().unwrap();
        assert_eq!(stored.id, receipt.id);
        assert_eq!(stored.total.cents(), 1500);
        assert_eq!(stored.orders, 3);
        assert!((stored.items - 4.5).abs() < f64::EPSILON);
        assert_eq!(stored.meta["provider"], "square");
    }

    #[tokio::test]
    async fn test_second_upsert_replaces_values_and_keeps_id() {
        let repo = repo().await;
        let first = repo.upsert(&input("client-1", 1500)).await.unwrap();

        let mut second = input("client-1", 900);
        second.orders = 1;
        let again = repo.upsert(&second).await.unwrap();

        assert_eq!(first.id, again.id);

        let range = DateRange::day(day(1));
        let rows = repo.list_for_location("loc-1", None, &range).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total.cents(), 900);
        assert_eq!(rows[0].orders, 1);
    }

    #[tokio::test]
    async fn test_other_client_is_forbidden_and_row_untouched() {
        let repo = repo().await;
        repo.upsert(&input("client-1", 1500)).await.unwrap();

        let err = repo.upsert(&input("client-2", 1)).await.unwrap_err();
        assert!(matches!(err, DbError::Forbidden));
        assert_eq!(err.to_string(), "forbidden");

        let stored = repo.get("loc-1", "square", day(1)).await.unwrap().unwrap();
        assert_eq!(stored.client_id, "client-1");
        assert_eq!(stored.total.cents(), 1500);
    }

    #[tokio::test]
    async fn test_list_filters_by_range_and_provider() {
        let repo = repo().await;
        for d in 1..=3 {
            let mut row = input("client-1", 100 * d as i64);
            row.date = day(d);
            repo.upsert(&row).await.unwrap();
        }
        let mut toast = input("client-1", 42);
        toast.provider = "toast".to_string();
        repo.upsert(&toast).await.unwrap();

        let range = DateRange::new(day(2), day(3)).unwrap();
        let rows = repo
            .list_for_location("loc-1", Some("square"), &range)
            .await
            .unwrap();
        assert_eq!(
            rows.iter().map(|r| r.date).collect::<Vec<_>>(),
            vec![day(2), day(3)]
        );

        let all_day_one = repo
            .list_for_location("loc-1", None, &DateRange::day(day(1)))
            .await
            .unwrap();
        assert_eq!(all_day_one.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let repo = repo().await;
        assert!(repo.get("loc-9", "clover", day(1)).await.unwrap().is_none());
    }
}
