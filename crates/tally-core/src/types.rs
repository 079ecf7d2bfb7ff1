//! # Domain Types
//!
//! Core domain types used throughout Tally.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌─────────────────┐      │
//! │  │ CanonicalSale   │   │ConsumptionRecord │   │    SyncRun      │      │
//! │  │  ─────────────  │   │  ──────────────  │   │  ─────────────  │      │
//! │  │  external_id    │──►│  (loc,prov,date) │   │  run_id         │      │
//! │  │  occurred_at    │   │  total / orders  │   │  status         │      │
//! │  │  total (Money)  │   │  items / taxes   │   │  count          │      │
//! │  │  items[]        │   │  discounts       │   │  duration_ms    │      │
//! │  └─────────────────┘   └──────────────────┘   └─────────────────┘      │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌─────────────────┐      │
//! │  │   SyncStatus    │   │ CredentialRecord │   │   DateRange     │      │
//! │  │  ─────────────  │   │  ──────────────  │   │  ─────────────  │      │
//! │  │  failures       │   │  cipher bundle   │   │  from ..= to    │      │
//! │  │  next_attempt_at│   │  version (CAS)   │   │  (inclusive)    │      │
//! │  │  paused_until   │   │  expires_at      │   │                 │      │
//! │  └─────────────────┘   └──────────────────┘   └─────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Provenance Rule
//! A `CanonicalSale` is only ever produced by a provider mapper. Nothing
//! downstream mutates one: aggregation borrows them as `&[CanonicalSale]`.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::money::Money;
use crate::vault::CipherBundle;
use crate::MAX_RANGE_DAYS;

// =============================================================================
// Date Range
// =============================================================================

/// An inclusive range of calendar days (UTC) to sync.
///
/// ## Why inclusive?
/// Schedulers think in days: "sync 2024-05-01" is `from == to`. Providers
/// want instants, so [`DateRange::start`] / [`DateRange::end_exclusive`]
/// convert to a half-open `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Creates a validated range.
    ///
    /// ## Errors
    /// - `InvertedRange` if `from > to`
    /// - `OutOfRange` if the window spans more than [`MAX_RANGE_DAYS`]
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, ValidationError> {
        if from > to {
            return Err(ValidationError::InvertedRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let range = DateRange { from, to };
        if range.days() > MAX_RANGE_DAYS {
            return Err(ValidationError::OutOfRange {
                field: "range_days".to_string(),
                min: 1,
                max: MAX_RANGE_DAYS,
            });
        }
        Ok(range)
    }

    /// A single-day range.
    pub fn day(date: NaiveDate) -> Self {
        DateRange {
            from: date,
            to: date,
        }
    }

    /// Number of days covered (inclusive).
    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    /// Every day in the range as its own single-day range, oldest first.
    pub fn split_days(&self) -> impl Iterator<Item = DateRange> {
        let days = usize::try_from(self.days()).unwrap_or(0);
        self.from.iter_days().take(days).map(DateRange::day)
    }

    /// First instant of the window.
    pub fn start(&self) -> DateTime<Utc> {
        self.from.and_time(NaiveTime::MIN).and_utc()
    }

    /// First instant AFTER the window.
    pub fn end_exclusive(&self) -> DateTime<Utc> {
        let next = self.to.checked_add_days(Days::new(1)).unwrap_or(self.to);
        next.and_time(NaiveTime::MIN).and_utc()
    }

    /// Returns true if `at` falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start() && at < self.end_exclusive()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

// =============================================================================
// Canonical Sale
// =============================================================================

/// One line of a canonical sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLine {
    /// Vendor SKU / catalog id, when the vendor has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub name: String,
    /// Quantity sold. Fractional for weighted items.
    pub qty: f64,
    /// Unit price.
    pub price: Money,
}

/// Provenance attached to every canonical sale.
///
/// `provider` is mandatory; vendor-specific extras ride along in `extra`
/// and are flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleMeta {
    pub provider: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SaleMeta {
    /// Meta with only the provider id set.
    pub fn new(provider: impl Into<String>) -> Self {
        SaleMeta {
            provider: provider.into(),
            extra: Map::new(),
        }
    }

    /// Adds one vendor-specific key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// The vendor-agnostic sale every mapper produces.
///
/// ## Wire shape
/// ```json
/// {
///   "external_id": "ord_123",
///   "occurred_at": "2024-05-01T12:30:00Z",
///   "total": 1599,
///   "status": "completed",
///   "items": [{ "sku": "LATTE", "name": "Latte", "qty": 2.0, "price": 450 }],
///   "meta": { "provider": "square", "location": "L1" }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSale {
    pub external_id: String,
    pub occurred_at: DateTime<Utc>,
    pub total: Money,
    /// Discounts applied to the sale (positive amount).
    #[serde(default)]
    pub discount: Money,
    /// Tax collected on the sale.
    #[serde(default)]
    pub tax: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub items: Vec<SaleLine>,
    pub meta: SaleMeta,
}

impl CanonicalSale {
    /// Total quantity across all lines.
    pub fn item_count(&self) -> f64 {
        self.items.iter().map(|line| line.qty).sum()
    }

    /// Returns true if the vendor reported this sale as voided/cancelled.
    pub fn is_voided(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("voided") | Some("void") | Some("canceled") | Some("cancelled")
        )
    }
}

// =============================================================================
// Consumption Record
// =============================================================================

/// Input for the consumption upsert.
///
/// ## Snapshot Semantics
/// Re-upserting the same `(location_id, provider, date)` REPLACES every
/// value. Nothing is added onto the previous row, so a retried run writes
/// exactly what the first run would have written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionInput {
    pub client_id: String,
    pub location_id: String,
    pub provider: String,
    pub date: NaiveDate,
    pub total: Money,
    pub orders: i64,
    pub items: f64,
    pub discounts: Money,
    pub taxes: Money,
    pub meta: Value,
}

/// Result of a consumption upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReceipt {
    pub id: String,
}

/// A stored daily consumption aggregate, as read by the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ConsumptionRecord {
    pub id: String,
    pub client_id: String,
    pub location_id: String,
    pub provider: String,
    #[ts(as = "String")]
    pub date: NaiveDate,
    pub total: Money,
    pub orders: i64,
    pub items: f64,
    pub discounts: Money,
    pub taxes: Money,
    #[ts(type = "Record<string, unknown>")]
    pub meta: Value,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Sync Run
// =============================================================================

/// Lifecycle state of a sync run.
///
/// ```text
/// start_sync ──► Running ──┬── log_success ──► Success
///                          └── log_error   ──► Error
/// ```
/// A run leaves `Running` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunState {
    Running,
    Success,
    Error,
}

impl SyncRunState {
    /// Returns true once the run has been closed.
    pub fn is_closed(&self) -> bool {
        !matches!(self, SyncRunState::Running)
    }
}

impl fmt::Display for SyncRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRunState::Running => write!(f, "running"),
            SyncRunState::Success => write!(f, "success"),
            SyncRunState::Error => write!(f, "error"),
        }
    }
}

/// One attempt to sync a (location, provider) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncRun {
    pub run_id: String,
    pub location_id: String,
    pub provider: String,
    #[ts(as = "String")]
    pub started_at: DateTime<Utc>,
    #[ts(as = "Option<String>")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SyncRunState,
    /// Number of canonical sales the run processed.
    pub count: i64,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

// =============================================================================
// Sync Status (Gate Row)
// =============================================================================

/// Persisted gate state for one (location, provider) pair.
///
/// ## Invariants
/// - `failures` only returns to 0 on a successful run
/// - `paused_until` is only set once `failures` reaches the pause threshold
///
/// Transitions live in [`crate::gate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncStatus {
    pub location_id: String,
    pub provider: String,
    pub failures: u32,
    #[ts(as = "Option<String>")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub paused_until: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// A fresh status row: never run, never failed.
    pub fn new(location_id: impl Into<String>, provider: impl Into<String>) -> Self {
        SyncStatus {
            location_id: location_id.into(),
            provider: provider.into(),
            failures: 0,
            next_attempt_at: None,
            paused_until: None,
            last_run_at: None,
            last_error: None,
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// An encrypted provider credential as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub location_id: String,
    pub provider: String,
    pub bundle: CipherBundle,
    /// When the provider token expires, if the provider issues expiring tokens.
    pub expires_at: Option<DateTime<Utc>>,
    /// Bumped on every swap; used for compare-and-swap.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Returns true if the credential expires before `deadline`.
    pub fn is_due(&self, deadline: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= deadline).unwrap_or(false)
    }
}

/// The decrypted contents of a cipher bundle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPayload {
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-side location / restaurant / merchant identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_ref: Option<String>,
}

impl CredentialPayload {
    /// A payload carrying only an API key.
    pub fn api_key(key: impl Into<String>) -> Self {
        CredentialPayload {
            api_key: key.into(),
            refresh_token: None,
            expires_at: None,
            merchant_ref: None,
        }
    }
}

/// Secrets never reach logs.
impl fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPayload")
            .field("api_key", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("merchant_ref", &self.merchant_ref)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_date_range_rejects_inverted() {
        let err = DateRange::new(date(2024, 5, 2), date(2024, 5, 1)).unwrap_err();
        assert!(matches!(err, ValidationError::InvertedRange { .. }));
    }

    #[test]
    fn test_date_range_rejects_oversized_window() {
        assert!(DateRange::new(date(2024, 1, 1), date(2024, 3, 1)).is_err());
        assert!(DateRange::new(date(2024, 1, 1), date(2024, 1, 31)).is_ok());
    }

    #[test]
    fn test_split_days() {
        let days: Vec<DateRange> = DateRange::new(date(2024, 2, 28), date(2024, 3, 1))
            .unwrap()
            .split_days()
            .collect();
        assert_eq!(
            days,
            vec![
                DateRange::day(date(2024, 2, 28)),
                DateRange::day(date(2024, 2, 29)),
                DateRange::day(date(2024, 3, 1)),
            ]
        );
        assert_eq!(DateRange::day(date(2024, 5, 1)).split_days().count(), 1);
    }

    #[test]
    fn test_date_range_window_is_half_open() {
        let range = DateRange::day(date(2024, 5, 1));
        assert_eq!(range.days(), 1);
        assert_eq!(
            range.start(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            range.end_exclusive(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
        assert!(range.contains(Utc.with_ymd_and_hms(2024, 5, 1, 23, 59, 59).unwrap()));
        assert!(!range.contains(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_sale_meta_flattens_extras() {
        let meta = SaleMeta::new("square").with("location", "L1");
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["provider"], "square");
        assert_eq!(json["location"], "L1");
    }

    #[test]
    fn test_sale_voided_statuses() {
        let mut sale = CanonicalSale {
            external_id: "s1".into(),
            occurred_at: Utc::now(),
            total: Money::from_cents(100),
            discount: Money::zero(),
            tax: Money::zero(),
            status: Some("completed".into()),
            items: vec![],
            meta: SaleMeta::new("toast"),
        };
        assert!(!sale.is_voided());
        sale.status = Some("voided".into());
        assert!(sale.is_voided());
    }

    #[test]
    fn test_credential_payload_debug_is_redacted() {
        let payload = CredentialPayload {
            api_key: "sk_live_secret".into(),
            refresh_token: Some("rt_secret".into()),
            expires_at: None,
            merchant_ref: Some("M1".into()),
        };
        let rendered = format!("{:?}", payload);
        assert!(!rendered.contains("sk_live_secret"));
        assert!(!rendered.contains("rt_secret"));
        assert!(rendered.contains("M1"));
    }

    #[test]
    fn test_run_state_closed() {
        assert!(!SyncRunState::Running.is_closed());
        assert!(SyncRunState::Success.is_closed());
        assert!(SyncRunState::Error.is_closed());
    }
}
