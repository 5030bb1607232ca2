//! HTTP client and tenant token broker

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use muxdrive_core::config::BackendConfig;
use muxdrive_core::domain::{Platform, Tenant, TenantId};
use muxdrive_core::{EngineError, EngineResult};

use crate::protocol::TokenResponse;

const INTL_BASE: &str = "https://open.larksuite.com";
const CN_BASE: &str = "https://open.feishu.cn";

/// Tokens are refreshed once they are within this many minutes of
/// expiring.
const REFRESH_WINDOW_MINUTES: i64 = 30;

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Concrete HTTP backend. Owns the reqwest client, the per-tenant token
/// cache, and upstream error mapping.
pub struct HttpDriveBackend {
    pub(crate) http: reqwest::Client,
    tokens: DashMap<TenantId, CachedToken>,
    base_override: Option<String>,
}

impl HttpDriveBackend {
    pub fn new(config: &BackendConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| EngineError::LocalIo(format!("http client: {e}")))?;
        Ok(Self {
            http,
            tokens: DashMap::new(),
            base_override: None,
        })
    }

    /// Points every tenant at one base URL. Test hook for mock servers.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base_override = Some(base.into());
        self
    }

    pub(crate) fn base_for(&self, tenant: &Tenant) -> &str {
        match &self.base_override {
            Some(base) => base.as_str(),
            None => match tenant.platform {
                Platform::Intl => INTL_BASE,
                Platform::Cn => CN_BASE,
            },
        }
    }

    pub(crate) fn url_for(
        &self,
        tenant: &Tenant,
        path: &str,
        query: &[(&str, String)],
    ) -> EngineResult<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_for(tenant), path))
            .map_err(|e| EngineError::InvalidArgument(format!("bad url: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Returns a valid access token for the tenant, fetching or refreshing
    /// through the auth endpoint when the cached one is stale.
    pub(crate) async fn access_token(&self, tenant: &Tenant) -> EngineResult<String> {
        if let Some(cached) = self.tokens.get(&tenant.id) {
            if cached.expires_at - Utc::now() > chrono::Duration::minutes(REFRESH_WINDOW_MINUTES) {
                return Ok(cached.token.clone());
            }
        }
        debug!(tenant_id = %tenant.id, "Fetching tenant access token");
        let url = self.url_for(tenant, "/open-apis/auth/v3/tenant_access_token/internal", &[])?;
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "app_id": tenant.app_id,
                "app_secret": tenant.app_secret,
            }))
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status("tenant_access_token", response).await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::UpstreamPermanent(format!("token body: {e}")))?;
        if body.code != 0 {
            return Err(EngineError::UpstreamPermanent(format!(
                "tenant_access_token: code {} ({})",
                body.code,
                body.msg.unwrap_or_default()
            )));
        }
        let token = body.tenant_access_token.ok_or_else(|| {
            EngineError::UpstreamPermanent("token response carried no token".into())
        })?;
        let expires_at = Utc::now() + chrono::Duration::seconds(body.expire.max(0));
        self.tokens.insert(
            tenant.id,
            CachedToken {
                token: token.clone(),
                expires_at,
            },
        );
        Ok(token)
    }

    /// Drops a cached token, forcing the next call to re-authenticate.
    pub fn invalidate_token(&self, tenant_id: &TenantId) {
        self.tokens.remove(tenant_id);
    }
}

/// Maps reqwest transport failures onto the error taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout(err.to_string())
    } else {
        EngineError::UpstreamTransient(err.to_string())
    }
}

/// Maps non-success HTTP statuses; returns the response untouched on
/// success so the caller can read the body.
pub(crate) async fn check_status(context: &str, response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{context}: HTTP {status} {body}");
    warn!(context, status = status.as_u16(), "Upstream rejected request");
    Err(if status == StatusCode::TOO_MANY_REQUESTS {
        EngineError::UpstreamRateLimited(detail)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        EngineError::Timeout(detail)
    } else if status.is_server_error() {
        EngineError::UpstreamTransient(detail)
    } else {
        EngineError::UpstreamPermanent(detail)
    })
}
