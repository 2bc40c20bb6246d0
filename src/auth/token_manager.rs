use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::assertion::sign_client_assertion;
use crate::auth::discovery::{DiscoveryClient, SmartConfiguration};
use crate::auth::AccessTokenProvider;
use crate::cache::token::CachedToken;
use crate::cache::token_cache::TokenCache;
use crate::config::client::ClientConfig;
use crate::config::proc_validator::ensure_valid;
use crate::config::settings::SettingsConfig;
use crate::errors::{ClientError, Result};
use crate::helpers::time::expires_at;
use crate::observability::metrics::get_metrics;
use crate::utils::constants::{CLIENT_ASSERTION_TYPE, DEFAULT_SESSION_TOKEN_TTL_SECS};

static GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
static GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub(crate) static GRANT_AUTHORIZATION_CODE: &str = "authorization_code";

/// Token endpoint answer, shared by every grant.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// SMART launch context
    pub patient: Option<String>,
    pub encounter: Option<String>,
}

/// Owns the single cached token of one client and every token endpoint
/// exchange that can replace it.
#[derive(Debug)]
pub struct TokenManager {
    client: Client,
    config: Arc<ClientConfig>,
    safety_margin_seconds: u64,
    /// resolved private key, backend flow only
    key_material: Option<String>,
    discovery: DiscoveryClient,
    /// advisory backend checks, run against the first discovered document
    compatibility: OnceLock<Vec<String>>,
    cache: TokenCache,
}

impl TokenManager {
    /// Validates the configuration and builds the shared HTTP client.
    pub fn new(config: ClientConfig, settings: &SettingsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms()))
            .build()
            .map_err(|e| ClientError::initialization(format!("failed to build HTTP client: {}", e)))?;
        Self::with_http_client(config, settings, client)
    }

    pub fn with_http_client(config: ClientConfig, settings: &SettingsConfig, client: Client) -> Result<Self> {
        ensure_valid(settings, &config)?;

        let key_material = config
            .backend
            .as_ref()
            .map(|backend| backend.private_key.resolve())
            .transpose()?;

        Ok(Self {
            discovery: DiscoveryClient::new(client.clone()),
            client,
            config: Arc::new(config),
            safety_margin_seconds: settings.safety_margin_seconds(),
            key_material,
            compatibility: OnceLock::new(),
            cache: TokenCache::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn http_client(&self) -> &Client {
        &self.client
    }

    pub async fn cached_token(&self) -> Option<CachedToken> {
        self.cache.get().await
    }

    /// SMART configuration of the configured issuer (memoized).
    pub async fn discover(&self) -> Result<Arc<SmartConfiguration>> {
        let configuration = self.discovery.discover(&self.config.issuer).await?;
        self.compatibility.get_or_init(|| match &self.config.backend {
            Some(backend) => configuration.backend_compatibility_warnings(backend.algorithm),
            None => Vec::new(),
        });
        Ok(configuration)
    }

    /// Backend compatibility warnings logged at first discovery; empty
    /// before that.
    pub fn compatibility_warnings(&self) -> &[String] {
        self.compatibility.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Cached token unless stale or `force_refresh`; otherwise a new one
    /// from the token endpoint.
    pub async fn get_access_token(&self, force_refresh: bool) -> Result<String> {
        if !force_refresh {
            if let Some(token) = self.cache.get_fresh().await {
                debug!("using cached access token");
                return Ok(token.access_token);
            }
        }

        let token = if self.config.backend.is_some() {
            self.request_client_credentials().await?
        } else if let Some(refresh_token) = self.cache.get().await.and_then(|t| t.refresh_token) {
            self.request_refresh(refresh_token).await?
        } else {
            return Err(ClientError::authentication(
                "no usable access token: complete the authorization code flow or configure backend key material",
            ));
        };

        let access_token = token.access_token.clone();
        self.cache.set(token).await;
        Ok(access_token)
    }

    async fn request_client_credentials(&self) -> Result<CachedToken> {
        let backend = self
            .config
            .backend
            .as_ref()
            .ok_or_else(|| ClientError::authentication("backend flow is not configured"))?;
        let key_material = self
            .key_material
            .as_deref()
            .ok_or_else(|| ClientError::authentication("backend key material is not available"))?;

        let smart = self.discover().await?;
        let assertion = sign_client_assertion(&self.config.client_id, backend, key_material, &smart.token_endpoint)?;

        let form = vec![
            ("grant_type", GRANT_CLIENT_CREDENTIALS.to_string()),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()),
            ("client_assertion", assertion),
            ("scope", self.config.scope.clone()),
        ];
        let response = self.post_token_endpoint(&smart.token_endpoint, GRANT_CLIENT_CREDENTIALS, &form).await?;

        let access_token = response
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ClientError::authentication("token response has no access_token"))?;
        let expires_in = response
            .expires_in
            .filter(|seconds| *seconds > 0)
            .ok_or_else(|| ClientError::authentication("token response has no positive expires_in"))?;

        info!("backend access token acquired, expires_in: {}", expires_in);
        Ok(
            CachedToken::new(access_token, expires_at(expires_in as u64), self.safety_margin_seconds)
                .with_scope(response.scope),
        )
    }

    pub(crate) async fn request_refresh(&self, refresh_token: String) -> Result<CachedToken> {
        let smart = self.discover().await?;
        let form = vec![
            ("grant_type", GRANT_REFRESH_TOKEN.to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", self.config.client_id.clone()),
        ];
        let response = self.post_token_endpoint(&smart.token_endpoint, GRANT_REFRESH_TOKEN, &form).await?;
        info!("access token refreshed with refresh_token grant");
        // servers that do not rotate refresh tokens omit it from the answer
        let fallback = Some(refresh_token);
        self.cached_from_response(response, fallback)
    }

    /// Turns a code or refresh answer into a cache entry; `expires_in` is optional here.
    pub(crate) fn cached_from_response(&self, response: TokenResponse, refresh_fallback: Option<String>) -> Result<CachedToken> {
        let access_token = response
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ClientError::authentication("token response has no access_token"))?;
        let expires_in = match response.expires_in {
            Some(seconds) if seconds > 0 => seconds as u64,
            Some(seconds) => {
                return Err(ClientError::authentication(format!(
                    "token response has non-positive expires_in {}",
                    seconds
                )))
            }
            None => DEFAULT_SESSION_TOKEN_TTL_SECS,
        };

        Ok(
            CachedToken::new(access_token, expires_at(expires_in), self.safety_margin_seconds)
                .with_refresh_token(response.refresh_token.or(refresh_fallback))
                .with_scope(response.scope),
        )
    }

    pub(crate) async fn store(&self, token: CachedToken) {
        self.cache.set(token).await;
    }

    /// Form-encoded POST; non-2xx answers become `Authentication` errors.
    pub(crate) async fn post_token_endpoint(
        &self,
        token_endpoint: &str,
        grant: &str,
        form: &[(&str, String)],
    ) -> Result<TokenResponse> {
        let metrics = get_metrics();
        debug!("POST {} grant_type={}", token_endpoint, grant);

        let result = self.exchange_form(token_endpoint, form).await;
        metrics
            .token_requests
            .with_label_values(&[grant, if result.is_ok() { "success" } else { "error" }])
            .inc();
        result.inspect_err(|e| warn!("token request ({}) failed: {}", grant, e))
    }

    async fn exchange_form(&self, token_endpoint: &str, form: &[(&str, String)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(token_endpoint)
            .header(http::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| ClientError::authentication(format!("token endpoint unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::authentication(format!("token response unreadable: {}", e)))?;

        if !status.is_success() {
            return Err(ClientError::authentication(format!(
                "token endpoint rejected the request with {}: {}",
                status,
                describe_oauth_error(&body)
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| ClientError::authentication(format!("invalid token response: {}", e)))
    }
}

impl AccessTokenProvider for TokenManager {
    async fn access_token(&self, force_refresh: bool) -> Result<String> {
        self.get_access_token(force_refresh).await
    }
}

/// `error: error_description` of an RFC 6749 error body, else the raw text.
fn describe_oauth_error(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            let error = json.get("error")?.as_str()?.to_owned();
            Some(match json.get("error_description").and_then(Value::as_str) {
                Some(description) => format!("{}: {}", error, description),
                None => error,
            })
        })
        .unwrap_or_else(|| body.to_string())
}
