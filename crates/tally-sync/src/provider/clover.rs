//! # Clover adapter
//!
//! Offset pagination over `GET /v3/merchants/{mId}/orders`. Like Toast, a
//! full page means there may be more.
//!
//! Clover speaks minor units and epoch milliseconds. `unitQty` is in
//! thousandths and only present on weighted items; a line without it is one
//! unit. Discount amounts come back negative.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::http::ProviderHttp;
use super::{default_token_expiry, AdapterContext, AdapterFactory, Page, PosAdapter, SalesSource};
use crate::error::{SyncError, SyncResult};
use tally_core::{CanonicalSale, CredentialPayload, Money, SaleLine, SaleMeta};

pub const PROVIDER: &str = "clover";
pub const DEFAULT_BASE_URL: &str = "https://api.clover.com";

// =============================================================================
// Raw Records
// =============================================================================

/// Clover's `{ "elements": [...] }` wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Elements<T> {
    #[serde(default = "Vec::new")]
    pub elements: Vec<T>,
}

impl<T> Default for Elements<T> {
    fn default() -> Self {
        Elements {
            elements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloverItemRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloverLineItem {
    pub id: String,
    #[serde(default)]
    pub item: Option<CloverItemRef>,
    #[serde(default)]
    pub name: String,
    /// Unit price, minor units.
    #[serde(default)]
    pub price: i64,
    /// Quantity in thousandths.
    #[serde(default)]
    pub unit_qty: Option<i64>,
    #[serde(default)]
    pub refunded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloverDiscount {
    #[serde(default)]
    pub amount: i64,
}

/// A Clover order with expanded line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloverOrder {
    pub id: String,
    /// Epoch milliseconds.
    pub created_time: i64,
    /// Minor units.
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub line_items: Elements<CloverLineItem>,
    #[serde(default)]
    pub discounts: Elements<CloverDiscount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdersResponse {
    #[serde(default)]
    elements: Vec<CloverOrder>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    /// Epoch seconds.
    #[serde(default)]
    access_token_expiration: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

// =============================================================================
// Mapper
// =============================================================================

fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Maps Clover orders to canonical sales.
///
/// Orders with an out-of-range `createdTime` are dropped with a warning.
pub fn map_sales(orders: &[CloverOrder]) -> Vec<CanonicalSale> {
    orders
        .iter()
        .filter_map(|order| {
            let Some(occurred_at) = from_millis(order.created_time) else {
                warn!(order_id = %order.id, created_time = order.created_time, "Dropping Clover order with invalid timestamp");
                return None;
            };

            let discount: i64 = order.discounts.elements.iter().map(|d| d.amount.abs()).sum();
            let items = order
                .line_items
                .elements
                .iter()
                .filter(|line| !line.refunded)
                .map(|line| SaleLine {
                    sku: line.item.as_ref().map(|item| item.id.clone()),
                    name: line.name.clone(),
                    qty: line.unit_qty.map(|q| q as f64 / 1000.0).unwrap_or(1.0),
                    price: Money::from_cents(line.price),
                })
                .collect();

            Some(CanonicalSale {
                external_id: order.id.clone(),
                occurred_at,
                total: Money::from_cents(order.total),
                discount: Money::from_cents(discount),
                tax: Money::zero(),
                status: order.state.as_ref().map(|s| s.to_ascii_lowercase()),
                items,
                meta: SaleMeta::new(PROVIDER),
            })
        })
        .collect()
}

// =============================================================================
// Adapter
// =============================================================================

/// Clover adapter bound to one merchant.
pub struct CloverAdapter {
    http: ProviderHttp,
    ctx: AdapterContext,
}

impl CloverAdapter {
    fn offset(cursor: Option<&str>) -> SyncResult<u64> {
        match cursor {
            None => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| SyncError::Internal(format!("bad Clover offset cursor: {}", raw))),
        }
    }
}

#[async_trait]
impl PosAdapter for CloverAdapter {
    type Raw = CloverOrder;

    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn validate(&self, api_key: &str) -> SyncResult<bool> {
        let path = format!("/v3/merchants/{}", self.ctx.merchant_ref());
        self.http
            .probe(self.http.get(&path).bearer_auth(api_key))
            .await
    }

    async fn fetch_raw(&self, cursor: Option<&str>) -> SyncResult<Page<CloverOrder>> {
        let range = self.ctx.require_range(PROVIDER)?;
        let offset = Self::offset(cursor)?;
        let limit = u64::from(self.ctx.page_size.max(1));

        let path = format!("/v3/merchants/{}/orders", self.ctx.merchant_ref());
        let request = self
            .http
            .get(&path)
            .bearer_auth(&self.ctx.credential.api_key)
            .query(&[
                ("filter", format!("createdTime>={}", range.start().timestamp_millis())),
                ("filter", format!("createdTime<{}", range.end_exclusive().timestamp_millis())),
                ("expand", "lineItems,discounts".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ]);
        let response: OrdersResponse = self.http.json(request).await?;

        let returned = response.elements.len() as u64;
        debug!(
            location_id = %self.ctx.location_id,
            offset,
            orders = returned,
            "Fetched Clover page"
        );
        Ok(Page {
            data: response.elements,
            next: (returned >= limit).then(|| (offset + returned).to_string()),
        })
    }

    fn map(&self, raw: Vec<CloverOrder>) -> Vec<CanonicalSale> {
        map_sales(&raw)
    }

    async fn refresh(&self, current: &CredentialPayload) -> SyncResult<CredentialPayload> {
        let refresh_token =
            current
                .refresh_token
                .as_deref()
                .ok_or_else(|| SyncError::RotationUnsupported {
                    provider: PROVIDER.to_string(),
                })?;

        let request = self
            .http
            .post("/oauth/v2/refresh")
            .json(&json!({ "refresh_token": refresh_token }));
        let token: RefreshResponse = self.http.json(request).await?;

        let expires_at = token
            .access_token_expiration
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(default_token_expiry);
        Ok(CredentialPayload {
            api_key: token.access_token,
            refresh_token: token.refresh_token.or_else(|| current.refresh_token.clone()),
            expires_at: Some(expires_at),
            merchant_ref: current.merchant_ref.clone(),
        })
    }
}

/// Builds [`CloverAdapter`]s.
pub struct CloverFactory {
    http: ProviderHttp,
}

impl CloverFactory {
    pub fn new(http: ProviderHttp) -> Self {
        CloverFactory { http }
    }
}

impl AdapterFactory for CloverFactory {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn create(&self, ctx: AdapterContext) -> Box<dyn SalesSource> {
        Box::new(CloverAdapter {
            http: self.http.clone(),
            ctx,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
