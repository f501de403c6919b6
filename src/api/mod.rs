use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::time::Duration;
use thiserror::Error;

use crate::identifier::Identifier;
use crate::models::{EpsForecastRow, PriceSnapshotRow, RecordUpdate, RemoteRecordPage};

pub mod eastmoney_client;
pub mod feishu_client;
pub mod ths_client;

pub use eastmoney_client::EastMoneyClient;
pub use feishu_client::FeishuClient;
pub use ths_client::ThsForecastClient;

/// Failures of the external capabilities
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Feishu API error {code}: {msg}")]
    Feishu { code: i64, msg: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected response: {0}")]
    Parse(String),
}

impl ApiError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth(_))
    }
}

/// Pacing for per-security requests
pub struct ApiRateLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl ApiRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let delay_ms = if requests_per_minute > 0 {
            60_000 / requests_per_minute as u64
        } else {
            1000 // Default 1 second delay
        };

        let quota = Quota::with_period(Duration::from_millis(delay_ms.max(1)))
            .unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN));

        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    pub async fn wait(&self) {
        self.limiter.until_ready().await;
    }
}

/// Market data capability: bulk spot snapshot and per-security forecasts
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_price_snapshot(&self) -> Result<Vec<PriceSnapshotRow>, ApiError>;
    async fn fetch_eps_forecast(&self, id: &Identifier) -> Result<Vec<EpsForecastRow>, ApiError>;
}

/// Destination table capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// First page of existing rows
    async fn list_records(&self) -> Result<RemoteRecordPage, ApiError>;

    /// Update existing rows in one request
    async fn batch_update_records(&self, updates: &[RecordUpdate]) -> Result<(), ApiError>;
}

/// A-share market data: EastMoney for spot prices, 10jqka for forecasts
pub struct AShareMarketData {
    spot: EastMoneyClient,
    forecast: ThsForecastClient,
}

impl AShareMarketData {
    pub fn new(spot: EastMoneyClient, forecast: ThsForecastClient) -> Self {
        Self { spot, forecast }
    }
}

#[async_trait]
impl MarketDataProvider for AShareMarketData {
    async fn fetch_price_snapshot(&self) -> Result<Vec<PriceSnapshotRow>, ApiError> {
        self.spot.fetch_spot_snapshot().await
    }

    async fn fetch_eps_forecast(&self, id: &Identifier) -> Result<Vec<EpsForecastRow>, ApiError> {
        self.forecast.fetch_eps_forecast(id).await
    }
}
