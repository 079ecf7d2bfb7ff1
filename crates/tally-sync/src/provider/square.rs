//! # Square adapter
//!
//! Cursor pagination over `POST /v2/orders/search`.
//!
//! ```text
//! request  { location_ids, limit, cursor?, query: closed_at window }
//! response { orders: [...], cursor? }     cursor absent → last page
//! ```
//!
//! Money is already in minor units. Line quantities are decimal strings
//! ("1", "0.5").

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::http::ProviderHttp;
use super::default_token_expiry;
use super::{AdapterContext, AdapterFactory, Page, PosAdapter, SalesSource};
use crate::error::{SyncError, SyncResult};
use tally_core::{CanonicalSale, CredentialPayload, Money, SaleLine, SaleMeta};

pub const PROVIDER: &str = "square";
pub const DEFAULT_BASE_URL: &str = "https://connect.squareup.com";

/// API version pinned in every request.
const SQUARE_VERSION: &str = "2024-05-15";

// =============================================================================
// Raw Records
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SquareMoney {
    pub amount: i64,
    #[serde(default)]
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquareLineItem {
    #[serde(default)]
    pub catalog_object_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub quantity: String,
    #[serde(default)]
    pub base_price_money: Option<SquareMoney>,
}

/// A Square order as returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquareOrder {
    pub id: String,
    pub location_id: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_money: Option<SquareMoney>,
    #[serde(default)]
    pub total_discount_money: Option<SquareMoney>,
    #[serde(default)]
    pub total_tax_money: Option<SquareMoney>,
    #[serde(default)]
    pub line_items: Vec<SquareLineItem>,
}

#[derive(Debug, Deserialize)]
struct SearchOrdersResponse {
    #[serde(default)]
    orders: Vec<SquareOrder>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Mapper
// =============================================================================

fn cents(money: &Option<SquareMoney>) -> Money {
    Money::from_cents(money.as_ref().map(|m| m.amount).unwrap_or(0))
}

/// Maps Square orders to canonical sales.
pub fn map_sales(orders: &[SquareOrder]) -> Vec<CanonicalSale> {
    orders
        .iter()
        .map(|order| CanonicalSale {
            external_id: order.id.clone(),
            occurred_at: order.closed_at.unwrap_or(order.created_at),
            total: cents(&order.total_money),
            discount: cents(&order.total_discount_money),
            tax: cents(&order.total_tax_money),
            status: Some(order.state.to_ascii_lowercase()),
            items: order
                .line_items
                .iter()
                .map(|line| SaleLine {
                    sku: line.catalog_object_id.clone(),
                    name: line.name.clone().unwrap_or_default(),
                    qty: quantity(&line.quantity),
                    price: cents(&line.base_price_money),
                })
                .collect(),
            meta: SaleMeta::new(PROVIDER).with("location", order.location_id.clone()),
        })
        .collect()
}

/// Square sends quantities as decimal strings. Anything unparsable, `NaN`
/// and `inf` included, counts as zero.
fn quantity(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|q| q.is_finite())
        .unwrap_or(0.0)
}

// =============================================================================
// Adapter
// =============================================================================

/// Square adapter bound to one location.
pub struct SquareAdapter {
    http: ProviderHttp,
    ctx: AdapterContext,
}

#[async_trait]
impl PosAdapter for SquareAdapter {
    type Raw = SquareOrder;

    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn validate(&self, api_key: &str) -> SyncResult<bool> {
        let request = self
            .http
            .get("/v2/locations")
            .bearer_auth(api_key)
            .header("Square-Version", SQUARE_VERSION);
        self.http.probe(request).await
    }

    async fn fetch_raw(&self, cursor: Option<&str>) -> SyncResult<Page<SquareOrder>> {
        let range = self.ctx.require_range(PROVIDER)?;
        let mut body = json!({
            "location_ids": [self.ctx.merchant_ref()],
            "limit": self.ctx.page_size,
            "query": {
                "filter": {
                    "date_time_filter": {
                        "closed_at": {
                            "start_at": range.start().to_rfc3339(),
                            "end_at": range.end_exclusive().to_rfc3339(),
                        }
                    },
                    "state_filter": { "states": ["COMPLETED", "CANCELED"] }
                },
                "sort": { "sort_field": "CLOSED_AT", "sort_order": "ASC" }
            }
        });
        if let Some(cursor) = cursor {
            body["cursor"] = json!(cursor);
        }

        let request = self
            .http
            .post("/v2/orders/search")
            .bearer_auth(&self.ctx.credential.api_key)
            .header("Square-Version", SQUARE_VERSION)
            .json(&body);
        let response: SearchOrdersResponse = self.http.json(request).await?;

        debug!(
            location_id = %self.ctx.location_id,
            orders = response.orders.len(),
            more = response.cursor.is_some(),
            "Fetched Square page"
        );
        Ok(Page {
            data: response.orders,
            next: response.cursor.filter(|c| !c.is_empty()),
        })
    }

    fn map(&self, raw: Vec<SquareOrder>) -> Vec<CanonicalSale> {
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
            .post("/oauth2/token")
            .header("Square-Version", SQUARE_VERSION)
            .json(&json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }));
        let token: TokenResponse = self.http.json(request).await?;

        Ok(CredentialPayload {
            api_key: token.access_token,
            refresh_token: token.refresh_token.or_else(|| current.refresh_token.clone()),
            expires_at: Some(token.expires_at.unwrap_or_else(default_token_expiry)),
            merchant_ref: current.merchant_ref.clone(),
        })
    }
}

/// Builds [`SquareAdapter`]s.
pub struct SquareFactory {
    http: ProviderHttp,
}

impl SquareFactory {
    pub fn new(http: ProviderHttp) -> Self {
        SquareFactory { http }
    }
}

impl AdapterFactory for SquareFactory {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn create(&self, ctx: AdapterContext) -> Box<dyn SalesSource> {
        Box::new(SquareAdapter {
            http: self.http.clone(),
            ctx,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
