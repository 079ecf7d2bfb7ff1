//! # Consumption Aggregation
//!
//! Folds every canonical sale of a sync window into ONE snapshot.
//!
//! ## Snapshot, Not Delta
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  page 1: [s1, s2, s3]  ─┐                                               │
//! │  page 2: [s4, s5]      ─┼──► from_sales(&[s1..s5]) ──► Snapshot         │
//! │                         │      orders    = 5                            │
//! │                         │      total     = Σ total                      │
//! │                         │      items     = Σ line qty                   │
//! │                         │      discounts = Σ discount                   │
//! │                         │      taxes     = Σ tax                        │
//! │                                                                         │
//! │  Re-running the same window yields the same snapshot, and the upsert    │
//! │  REPLACES the stored row. Nothing here is incremental.                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::money::Money;
use crate::types::{CanonicalSale, ConsumptionInput, DateRange};

/// The aggregate of one sync window.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionSnapshot {
    pub orders: i64,
    pub total: Money,
    pub items: f64,
    pub discounts: Money,
    pub taxes: Money,
    pub voided: i64,
    pub first_sale_at: Option<DateTime<Utc>>,
    pub last_sale_at: Option<DateTime<Utc>>,
}

impl ConsumptionSnapshot {
    /// Aggregates the given sales.
    ///
    /// Every returned sale counts, voided ones included; `voided` is carried
    /// in the meta so the dashboard can tell them apart.
    ///
    /// ## Example
    /// ```rust
    /// use tally_core::ConsumptionSnapshot;
    ///
    /// let snapshot = ConsumptionSnapshot::from_sales(&[]);
    /// assert_eq!(snapshot.orders, 0);
    /// assert!(snapshot.total.is_zero());
    /// ```
    pub fn from_sales(sales: &[CanonicalSale]) -> Self {
        let mut snapshot = ConsumptionSnapshot {
            orders: 0,
            total: Money::zero(),
            items: 0.0,
            discounts: Money::zero(),
            taxes: Money::zero(),
            voided: 0,
            first_sale_at: None,
            last_sale_at: None,
        };

        for sale in sales {
            snapshot.orders += 1;
            snapshot.total += sale.total;
            snapshot.discounts += sale.discount;
            snapshot.taxes += sale.tax;
            snapshot.items += sale.item_count();
            if sale.is_voided() {
                snapshot.voided += 1;
            }
            snapshot.first_sale_at = Some(match snapshot.first_sale_at {
                Some(first) => first.min(sale.occurred_at),
                None => sale.occurred_at,
            });
            snapshot.last_sale_at = Some(match snapshot.last_sale_at {
                Some(last) => last.max(sale.occurred_at),
                None => sale.occurred_at,
            });
        }

        snapshot
    }

    /// Builds the consumption upsert input for this snapshot.
    ///
    /// The record is dated by `range.from`. The orchestrator only passes
    /// single-day ranges, so that is the day the sales belong to.
    pub fn into_input(
        self,
        client_id: &str,
        location_id: &str,
        provider: &str,
        range: &DateRange,
    ) -> ConsumptionInput {
        let meta = self.meta(provider, range);
        ConsumptionInput {
            client_id: client_id.to_string(),
            location_id: location_id.to_string(),
            provider: provider.to_string(),
            date: range.from,
            total: self.total,
            orders: self.orders,
            items: self.items,
            discounts: self.discounts,
            taxes: self.taxes,
            meta,
        }
    }

    fn meta(&self, provider: &str, range: &DateRange) -> Value {
        json!({
            "provider": provider,
            "from": range.from.to_string(),
            "to": range.to.to_string(),
            "voided": self.voided,
            "first_sale_at": self.first_sale_at.map(|at| at.to_rfc3339()),
            "last_sale_at": self.last_sale_at.map(|at| at.to_rfc3339()),
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
