//! # POS Provider Adapters
//!
//! One adapter per vendor. Each owns its wire format, its pagination style
//! and a pure mapper to [`CanonicalSale`].
//!
//! ## Two traits
//! ```text
//! ┌──────────────────────────┐  blanket impl  ┌──────────────────────────┐
//! │ PosAdapter               │ ─────────────► │ SalesSource (dyn-safe)   │
//! │   type Raw               │                │                          │
//! │   validate(key)          │                │   validate(key)          │
//! │   fetch_raw(cursor)      │                │   fetch_sales(cursor)    │
//! │   map(&[Raw])  (pure)    │                │     = map(fetch_raw(..)) │
//! │   refresh(payload)       │                │   refresh(payload)       │
//! └──────────────────────────┘                └────────────┬─────────────┘
//!                                                          │
//!          ProviderRegistry: "square" → Arc<dyn AdapterFactory> ──┘
//! ```
//!
//! Vendor code is written against the typed [`PosAdapter`], so a raw Square
//! order can never be handed to the Toast mapper. The orchestrator only sees
//! `dyn SalesSource`.
//!
//! ## Pagination
//! The cursor is opaque outside the adapter. Square hands back a cursor
//! string, Toast a page number, Clover an offset; all three travel as a
//! `String`. A page without `next` is the last one.

pub mod clover;
pub mod http;
pub mod registry;
pub mod square;
pub mod toast;

#[cfg(test)]
pub(crate) mod stub;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SyncError, SyncResult};
use tally_core::{CanonicalSale, CredentialPayload, DateRange};

pub use registry::{AdapterFactory, ProviderRegistry};

/// Provider ids with a built-in adapter.
pub const BUILTIN_PROVIDERS: [&str; 3] = [square::PROVIDER, toast::PROVIDER, clover::PROVIDER];

// =============================================================================
// Page
// =============================================================================

/// One page of a provider listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    /// Cursor for the following page; `None` on the last page.
    pub next: Option<String>,
}

impl<T> Page<T> {
    /// The final page.
    pub fn last(data: Vec<T>) -> Self {
        Page { data, next: None }
    }

    /// Maps the records, keeping the cursor.
    pub fn map<U>(self, f: impl FnOnce(Vec<T>) -> Vec<U>) -> Page<U> {
        Page {
            data: f(self.data),
            next: self.next,
        }
    }
}

// =============================================================================
// Adapter Context
// =============================================================================

/// Everything an adapter instance is bound to.
///
/// An adapter is created per run (or per validation) and never outlives it.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub location_id: String,
    pub credential: CredentialPayload,
    /// Window to list sales for. Unused by `validate` and `refresh`.
    pub range: Option<DateRange>,
    pub page_size: u32,
}

impl AdapterContext {
    /// Context for listing sales in `range`.
    pub fn for_range(
        location_id: impl Into<String>,
        credential: CredentialPayload,
        range: DateRange,
        page_size: u32,
    ) -> Self {
        AdapterContext {
            location_id: location_id.into(),
            credential,
            range: Some(range),
            page_size,
        }
    }

    /// Context for credential checks and refreshes.
    pub fn for_credential(location_id: impl Into<String>, credential: CredentialPayload) -> Self {
        AdapterContext {
            location_id: location_id.into(),
            credential,
            range: None,
            page_size: 1,
        }
    }

    /// The provider-side id, falling back to our location id.
    pub fn merchant_ref(&self) -> &str {
        self.credential
            .merchant_ref
            .as_deref()
            .unwrap_or(&self.location_id)
    }

    pub(crate) fn require_range(&self, provider: &str) -> SyncResult<&DateRange> {
        self.range.as_ref().ok_or_else(|| {
            SyncError::Internal(format!("{} adapter used to list sales without a range", provider))
        })
    }
}

// =============================================================================
// Traits
// =============================================================================

/// A typed vendor adapter.
#[async_trait]
pub trait PosAdapter: Send + Sync {
    /// The vendor's own sale record.
    type Raw: Send;

    fn provider(&self) -> &'static str;

    /// Lightweight credential check. `Ok(false)` means the provider refused
    /// the key; errors are reserved for the provider being unreachable.
    async fn validate(&self, api_key: &str) -> SyncResult<bool>;

    /// Fetches one page of raw records.
    async fn fetch_raw(&self, cursor: Option<&str>) -> SyncResult<Page<Self::Raw>>;

    /// Pure mapping to canonical sales.
    fn map(&self, raw: Vec<Self::Raw>) -> Vec<CanonicalSale>;

    /// Trades the refresh token for a new credential.
    async fn refresh(&self, _current: &CredentialPayload) -> SyncResult<CredentialPayload> {
        Err(SyncError::RotationUnsupported {
            provider: self.provider().to_string(),
        })
    }
}

/// The object-safe face of an adapter.
#[async_trait]
pub trait SalesSource: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn validate(&self, api_key: &str) -> SyncResult<bool>;

    /// Fetches one page, already mapped.
    async fn fetch_sales(&self, cursor: Option<&str>) -> SyncResult<Page<CanonicalSale>>;

    async fn refresh(&self, current: &CredentialPayload) -> SyncResult<CredentialPayload>;
}

#[async_trait]
impl<A> SalesSource for A
where
    A: PosAdapter,
{
    fn provider(&self) -> &'static str {
        PosAdapter::provider(self)
    }

    async fn validate(&self, api_key: &str) -> SyncResult<bool> {
        PosAdapter::validate(self, api_key).await
    }

    async fn fetch_sales(&self, cursor: Option<&str>) -> SyncResult<Page<CanonicalSale>> {
        let page = self.fetch_raw(cursor).await?;
        Ok(page.map(|raw| self.map(raw)))
    }

    async fn refresh(&self, current: &CredentialPayload) -> SyncResult<CredentialPayload> {
        PosAdapter::refresh(self, current).await
    }
}

/// Expiry for a refreshed token when the provider does not send one.
pub(crate) fn default_token_expiry() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::days(30)
}
