//! # Toast adapter
//!
//! Page-number pagination over `GET /orders/v2/ordersBulk`. Toast does not
//! say whether more pages exist; a full page means "maybe", a short page
//! means "no".
//!
//! Amounts are decimal major units (`12.5` dollars) and are converted to
//! minor units here. An order carries one or more checks; voided checks and
//! voided selections are left out of totals.
//!
//! Toast offers no refresh grant to partners, so rotation is unsupported.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::http::ProviderHttp;
use super::{AdapterContext, AdapterFactory, Page, PosAdapter, SalesSource};
use crate::error::{SyncError, SyncResult};
use tally_core::{CanonicalSale, Money, SaleLine, SaleMeta};

pub const PROVIDER: &str = "toast";
pub const DEFAULT_BASE_URL: &str = "https://ws-api.toasttab.com";

/// Toast's timestamp layout (`2024-05-01T10:00:00.000+0000`).
const TOAST_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

const RESTAURANT_HEADER: &str = "Toast-Restaurant-External-ID";

// =============================================================================
// Raw Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastItemRef {
    pub guid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastSelection {
    #[serde(default)]
    pub item: Option<ToastItemRef>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub quantity: f64,
    /// Unit price, major units.
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub voided: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastDiscount {
    #[serde(default)]
    pub discount_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastCheck {
    #[serde(default)]
    pub total_amount: f64,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default)]
    pub applied_discounts: Vec<ToastDiscount>,
    #[serde(default)]
    pub selections: Vec<ToastSelection>,
    #[serde(default)]
    pub voided: bool,
}

/// A Toast order from the bulk endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastOrder {
    pub guid: String,
    #[serde(deserialize_with = "toast_time")]
    pub opened_date: DateTime<Utc>,
    #[serde(default, deserialize_with = "toast_time_opt")]
    pub closed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub voided: bool,
    #[serde(default)]
    pub checks: Vec<ToastCheck>,
}

fn parse_toast_time(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, TOAST_TIME_FORMAT))
        .map(|at| at.with_timezone(&Utc))
}

fn toast_time<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(de)?;
    parse_toast_time(&raw).map_err(serde::de::Error::custom)
}

fn toast_time_opt<'de, D: Deserializer<'de>>(de: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(de)? {
        Some(raw) => parse_toast_time(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

// =============================================================================
// Mapper
// =============================================================================

fn order_status(order: &ToastOrder) -> &'static str {
    if order.voided {
        "voided"
    } else if order.closed_date.is_some() {
        "closed"
    } else {
        "open"
    }
}

/// Maps Toast orders to canonical sales.
pub fn map_sales(orders: &[ToastOrder]) -> Vec<CanonicalSale> {
    orders
        .iter()
        .map(|order| {
            let live: Vec<&ToastCheck> = order.checks.iter().filter(|c| !c.voided).collect();

            let total: f64 = live.iter().map(|c| c.total_amount).sum();
            let tax: f64 = live.iter().map(|c| c.tax_amount).sum();
            let discount: f64 = live
                .iter()
                .flat_map(|c| c.applied_discounts.iter())
                .map(|d| d.discount_amount)
                .sum();
            let items = live
                .iter()
                .flat_map(|c| c.selections.iter())
                .filter(|s| !s.voided)
                .map(|s| SaleLine {
                    sku: s.item.as_ref().map(|item| item.guid.clone()),
                    name: s.display_name.clone(),
                    qty: s.quantity,
                    price: Money::from_major(s.price),
                })
                .collect();

            CanonicalSale {
                external_id: order.guid.clone(),
                occurred_at: order.closed_date.unwrap_or(order.opened_date),
                total: Money::from_major(total),
                discount: Money::from_major(discount),
                tax: Money::from_major(tax),
                status: Some(order_status(order).to_string()),
                items,
                meta: SaleMeta::new(PROVIDER).with("checks", order.checks.len()),
            }
        })
        .collect()
}

// =============================================================================
// Adapter
// =============================================================================

/// Toast adapter bound to one restaurant.
pub struct ToastAdapter {
    http: ProviderHttp,
    ctx: AdapterContext,
}

impl ToastAdapter {
    fn page_number(cursor: Option<&str>) -> SyncResult<u32> {
        match cursor {
            None => Ok(1),
            Some(raw) => raw
                .parse()
                .map_err(|_| SyncError::Internal(format!("bad Toast page cursor: {}", raw))),
        }
    }
}

#[async_trait]
impl PosAdapter for ToastAdapter {
    type Raw = ToastOrder;

    fn provider(&self) -> &'static str {
        PROVIDER
    }

    async fn validate(&self, api_key: &str) -> SyncResult<bool> {
        let path = format!("/restaurants/v1/restaurants/{}", self.ctx.merchant_ref());
        let request = self
            .http
            .get(&path)
            .bearer_auth(api_key)
            .header(RESTAURANT_HEADER, self.ctx.merchant_ref());
        self.http.probe(request).await
    }

    async fn fetch_raw(&self, cursor: Option<&str>) -> SyncResult<Page<ToastOrder>> {
        let range = self.ctx.require_range(PROVIDER)?;
        let page = Self::page_number(cursor)?;
        let page_size = self.ctx.page_size.max(1);

        let request = self
            .http
            .get("/orders/v2/ordersBulk")
            .bearer_auth(&self.ctx.credential.api_key)
            .header(RESTAURANT_HEADER, self.ctx.merchant_ref())
            .query(&[
                ("startDate", range.start().format(TOAST_TIME_FORMAT).to_string()),
                ("endDate", range.end_exclusive().format(TOAST_TIME_FORMAT).to_string()),
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
            ]);
        let orders: Vec<ToastOrder> = self.http.json(request).await?;

        let full = orders.len() >= page_size as usize;
        debug!(
            location_id = %self.ctx.location_id,
            page,
            orders = orders.len(),
            "Fetched Toast page"
        );
        Ok(Page {
            data: orders,
            next: full.then(|| (page + 1).to_string()),
        })
    }

    fn map(&self, raw: Vec<ToastOrder>) -> Vec<CanonicalSale> {
        map_sales(&raw)
    }
}

/// Builds [`ToastAdapter`]s.
pub struct ToastFactory {
    http: ProviderHttp,
}

impl ToastFactory {
    pub fn new(http: ProviderHttp) -> Self {
        ToastFactory { http }
    }
}

impl AdapterFactory for ToastFactory {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn create(&self, ctx: AdapterContext) -> Box<dyn SalesSource> {
        Box::new(ToastAdapter {
            http: self.http.clone(),
            ctx,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
