//! EastMoney spot snapshot client
//!
//! Pulls the latest quote of every listed A-share from the `clist` endpoint,
//! page by page, keeping only the columns the pipeline needs.

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ApiError;
use crate::models::PriceSnapshotRow;

/// Shanghai main board, STAR, Shenzhen main board, ChiNext and Beijing
const ALL_A_SHARES: &str = "m:0 t:6,m:0 t:80,m:1 t:2,m:1 t:23,m:0 t:81 s:2048";
const SPOT_FIELDS: &str = "f2,f12,f14,f20";
const DEFAULT_PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 500;

#[derive(Debug, Deserialize)]
struct ClistResponse {
    data: Option<ClistData>,
}

#[derive(Debug, Deserialize)]
struct ClistData {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    diff: Vec<SpotQuote>,
}

#[derive(Debug, Deserialize)]
struct SpotQuote {
    #[serde(rename = "f12")]
    code: String,
    #[serde(rename = "f14", default)]
    name: String,
    #[serde(rename = "f2", default)]
    latest_price: Value,
    #[serde(rename = "f20", default)]
    market_cap: Value,
}

/// Quote values are numbers, or `"-"` for suspended securities
fn quote_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

/// EastMoney market data client
pub struct EastMoneyClient {
    client: Client,
    base_url: String,
    page_size: u32,
}

impl EastMoneyClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("stock-sync/1.0")
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(&self, page: u32) -> Result<ClistData, ApiError> {
        let url = format!("{}/api/qt/clist/get", self.base_url);
        let page_str = page.to_string();
        let page_size_str = self.page_size.to_string();

        debug!("Requesting spot page {} from {}", page, url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("pn", page_str.as_str()),
                ("pz", page_size_str.as_str()),
                ("po", "1"),
                ("np", "1"),
                ("fltt", "2"),
                ("invt", "2"),
                ("fid", "f12"),
                ("fs", ALL_A_SHARES),
                ("fields", SPOT_FIELDS),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }

        let parsed: ClistResponse = response.json().await?;
        Ok(parsed.data.unwrap_or(ClistData { total: 0, diff: Vec::new() }))
    }

    /// Fetch the spot snapshot of every A-share
    pub async fn fetch_spot_snapshot(&self) -> Result<Vec<PriceSnapshotRow>, ApiError> {
        let mut rows = Vec::new();
        let mut total = 0;

        for page in 1..=MAX_PAGES {
            let data = self.fetch_page(page).await?;
            total = total.max(data.total);

            if data.diff.is_empty() {
                break;
            }

            rows.extend(data.diff.into_iter().map(|quote| PriceSnapshotRow {
                latest_price: quote_number(&quote.latest_price),
                market_cap: quote_number(&quote.market_cap),
                code: quote.code,
                name: quote.name,
            }));

            if rows.len() as u64 >= total {
                break;
            }
            if page == MAX_PAGES {
                warn!("Stopped spot paging at {} pages ({} of {} rows)", MAX_PAGES, rows.len(), total);
            }
        }

        if rows.is_empty() {
            return Err(ApiError::Parse("spot snapshot returned no rows".to_string()));
        }

        info!("📈 Retrieved {} spot quotes", rows.len());
        Ok(rows)
    }
}
