use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ApiError, RemoteTable};
use crate::models::{FeishuConfig, RecordUpdate, RemoteField, RemoteRecord, RemoteRecordPage};

/// Refresh the tenant token this long before it actually expires
const TOKEN_SAFETY_MARGIN_SECS: i64 = 300;

/// Envelope codes meaning the bearer token was missing, invalid or expired
const TOKEN_ERROR_CODES: [i64; 4] = [99991661, 99991663, 99991664, 99991668];

/// Tenant token exchange response
#[derive(Debug, Deserialize)]
struct TenantTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<i64>,
}

/// Standard `{code, msg, data}` envelope of the open API
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RecordListData {
    #[serde(default)]
    items: Option<Vec<RemoteRecord>>,
    #[serde(default)]
    has_more: bool,
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FieldListData {
    #[serde(default)]
    items: Option<Vec<RemoteField>>,
}

/// Cached tenant token
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Feishu Bitable client
pub struct FeishuClient {
    client: Client,
    api_base_url: String,
    app_id: String,
    app_secret: String,
    user_access_token: Option<String>,
    app_token: String,
    table_id: String,
    page_size: u32,
    current_token: Arc<Mutex<Option<CachedToken>>>,
}

impl FeishuClient {
    /// Create a new Feishu client
    pub fn new(config: &FeishuConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("stock-sync/1.0")
            .build()?;

        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            user_access_token: config.user_access_token.clone(),
            app_token: config.app_token.clone(),
            table_id: config.table_id.clone(),
            page_size: config.page_size,
            current_token: Arc::new(Mutex::new(None)),
        })
    }

    fn table_url(&self, suffix: &str) -> String {
        format!(
            "{}/open-apis/bitable/v1/apps/{}/tables/{}/{}",
            self.api_base_url, self.app_token, self.table_id, suffix
        )
    }

    /// Exchange app credentials for a tenant access token
    async fn fetch_tenant_token(&self) -> Result<CachedToken, ApiError> {
        let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.api_base_url);
        let now = Utc::now();

        let response = self
            .client
            .post(&url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Auth(format!("token endpoint returned {}: {}", status, body)));
        }

        let token: TenantTokenResponse = response.json().await?;
        if token.code != 0 {
            return Err(ApiError::Auth(format!("code {}: {}", token.code, token.msg)));
        }

        let access_token = token
            .tenant_access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Auth("response carried no tenant_access_token".to_string()))?;
        let expires_in = token.expire.unwrap_or(7200);
        let expires_at = now + chrono::Duration::seconds(expires_in);

        info!("🔑 Obtained tenant access token, valid for {} seconds", expires_in);
        Ok(CachedToken { access_token, expires_at })
    }

    /// Get a bearer token, refreshing the cached tenant token if necessary
    async fn access_token(&self) -> Result<String, ApiError> {
        if let Some(user_token) = &self.user_access_token {
            return Ok(user_token.clone());
        }

        let mut token_guard = self.current_token.lock().await;
        if let Some(token) = &*token_guard {
            if token.expires_at > Utc::now() + chrono::Duration::seconds(TOKEN_SAFETY_MARGIN_SECS) {
                return Ok(token.access_token.clone());
            }
            debug!("Tenant token expires at {}, refreshing", token.expires_at);
        }

        let fresh = self.fetch_tenant_token().await?;
        let access_token = fresh.access_token.clone();
        *token_guard = Some(fresh);
        Ok(access_token)
    }

    /// Drop the cached tenant token and fetch a new one
    pub async fn refresh_token(&self) -> Result<(), ApiError> {
        self.current_token.lock().await.take();
        self.access_token().await.map(|_| ())
    }

    /// Make an authenticated request, refreshing the tenant token once if
    /// the API rejects it
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>, ApiError> {
        let retry = request.try_clone();
        match self.send_once(request).await {
            Err(e) if e.is_auth() && self.user_access_token.is_none() => match retry {
                Some(retry) => {
                    warn!("🔑 Access token rejected ({}), refreshing", e);
                    self.refresh_token().await?;
                    self.send_once(retry).await
                }
                None => Err(e),
            },
            result => result,
        }
    }

    /// Make an authenticated request and unwrap the response envelope
    async fn send_once<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>, ApiError> {
        let access_token = self.access_token().await?;

        let response = request.bearer_auth(access_token).send().await?;
        let status = response.status();
        let body = response.text().await?;

        // Errors come back as envelopes too, usually with a 4xx status
        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Status { status: status.as_u16(), body });
            }
            Err(e) => return Err(ApiError::Parse(format!("invalid envelope: {}", e))),
        };

        if envelope.code != 0 {
            if TOKEN_ERROR_CODES.contains(&envelope.code) {
                return Err(ApiError::Auth(format!("code {}: {}", envelope.code, envelope.msg)));
            }
            return Err(ApiError::Feishu { code: envelope.code, msg: envelope.msg });
        }

        Ok(envelope.data)
    }

    /// List up to `page_size` records of the table
    pub async fn list_records_page(&self, page_size: u32) -> Result<RemoteRecordPage, ApiError> {
        let request = self
            .client
            .get(self.table_url("records"))
            .query(&[("page_size", page_size.to_string())]);

        let data: Option<RecordListData> = self.send(request).await?;
        let page = data
            .map(|d| RemoteRecordPage {
                records: d.items.unwrap_or_default(),
                has_more: d.has_more,
                total: d.total,
            })
            .unwrap_or_default();

        if page.has_more {
            warn!(
                "⚠️ Table has more than {} records; only the first page is reconciled",
                page_size
            );
        }
        Ok(page)
    }

    /// List the field definitions of the table
    pub async fn list_fields(&self) -> Result<Vec<RemoteField>, ApiError> {
        let request = self
            .client
            .get(self.table_url("fields"))
            .query(&[("page_size", "100")]);

        let data: Option<FieldListData> = self.send(request).await?;
        Ok(data.and_then(|d| d.items).unwrap_or_default())
    }
}

#[async_trait]
impl RemoteTable for FeishuClient {
    async fn list_records(&self) -> Result<RemoteRecordPage, ApiError> {
        self.list_records_page(self.page_size).await
    }

    async fn batch_update_records(&self, updates: &[RecordUpdate]) -> Result<(), ApiError> {
        if updates.is_empty() {
            return Ok(());
        }

        let request = self
            .client
            .post(self.table_url("records/batch_update"))
            .json(&json!({ "records": updates }));

        let _: Option<Value> = self.send(request).await?;
        Ok(())
    }
}
