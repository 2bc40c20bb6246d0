use std::collections::HashMap;
use std::sync::Arc;

use jsonwebtoken::Algorithm;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::errors::{ClientError, Result};
use crate::observability::metrics::get_metrics;
use crate::utils::constants::{PRIVATE_KEY_JWT, SMART_CONFIGURATION_PATH};

/// Server metadata published at `/.well-known/smart-configuration`.
#[derive(Debug, Clone, Serialize)]
pub struct SmartConfiguration {
    pub issuer: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: String,
    pub jwks_uri: Option<String>,
    pub grant_types_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
    pub capabilities: Vec<String>,
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,
    pub token_endpoint_auth_signing_alg_values_supported: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WellKnownDocument {
    issuer: Option<String>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    jwks_uri: Option<String>,
    #[serde(default)]
    grant_types_supported: Vec<String>,
    #[serde(default)]
    code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    token_endpoint_auth_methods_supported: Option<Vec<String>>,
    token_endpoint_auth_signing_alg_values_supported: Option<Vec<String>>,
}

impl TryFrom<WellKnownDocument> for SmartConfiguration {
    type Error = ClientError;

    fn try_from(doc: WellKnownDocument) -> Result<Self> {
        let token_endpoint = doc
            .token_endpoint
            .filter(|endpoint| !endpoint.trim().is_empty())
            .ok_or_else(|| ClientError::discovery("smart-configuration has no token_endpoint"))?;

        Ok(Self {
            issuer: doc.issuer,
            authorization_endpoint: doc.authorization_endpoint,
            token_endpoint,
            jwks_uri: doc.jwks_uri,
            grant_types_supported: doc.grant_types_supported,
            code_challenge_methods_supported: doc.code_challenge_methods_supported,
            capabilities: doc.capabilities,
            token_endpoint_auth_methods_supported: doc.token_endpoint_auth_methods_supported,
            token_endpoint_auth_signing_alg_values_supported: doc.token_endpoint_auth_signing_alg_values_supported,
        })
    }
}

impl SmartConfiguration {
    /// Advisory checks for the private_key_jwt flow. Never fails; every
    /// mismatch is logged and returned.
    pub fn backend_compatibility_warnings(&self, algorithm: Algorithm) -> Vec<String> {
        let mut warnings = Vec::new();
        let algorithm = format!("{:?}", algorithm);

        if let Some(methods) = &self.token_endpoint_auth_methods_supported {
            if !methods.iter().any(|m| m == PRIVATE_KEY_JWT) {
                warnings.push(format!(
                    "server does not advertise '{}' in token_endpoint_auth_methods_supported {:?}",
                    PRIVATE_KEY_JWT, methods
                ));
            }
        }
        if let Some(algs) = &self.token_endpoint_auth_signing_alg_values_supported {
            if !algs.iter().any(|a| a == &algorithm) {
                warnings.push(format!(
                    "server does not advertise '{}' in token_endpoint_auth_signing_alg_values_supported {:?}",
                    algorithm, algs
                ));
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        warnings
    }
}

/// `{origin}/.well-known/smart-configuration` for any URL on the server.
pub fn well_known_url(base_url: &str) -> Result<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| ClientError::discovery(format!("invalid server url '{}': {}", base_url, e)))?;
    match url.origin() {
        origin @ Origin::Tuple(..) => {
            let well_known = format!("{}{}", origin.ascii_serialization(), SMART_CONFIGURATION_PATH);
            Url::parse(&well_known).map_err(|e| ClientError::discovery(e.to_string()))
        }
        Origin::Opaque(_) => Err(ClientError::discovery(format!(
            "server url '{}' has no origin",
            base_url
        ))),
    }
}

/// Fetches and memoizes SMART configurations, one per origin.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    client: Client,
    cache: Arc<RwLock<HashMap<String, Arc<SmartConfiguration>>>>,
}

impl DiscoveryClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn discover(&self, issuer_or_base_url: &str) -> Result<Arc<SmartConfiguration>> {
        let url = well_known_url(issuer_or_base_url)?;
        let key = url.to_string();

        if let Some(cached) = self.cache.read().await.get(&key) {
            debug!("smart-configuration cache hit for {}", key);
            return Ok(cached.clone());
        }

        let metrics = get_metrics();
        let fetched = self.fetch(&url).await;
        metrics
            .discovery_requests
            .with_label_values(&[if fetched.is_ok() { "success" } else { "error" }])
            .inc();
        let configuration = Arc::new(fetched?);

        info!("discovered token endpoint {} for {}", configuration.token_endpoint, key);
        self.cache.write().await.insert(key, configuration.clone());
        Ok(configuration)
    }

    async fn fetch(&self, url: &Url) -> Result<SmartConfiguration> {
        let response = self
            .client
            .get(url.clone())
            .header(http::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ClientError::discovery(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::discovery(format!("GET {} returned {}", url, status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::discovery(format!("GET {} body unreadable: {}", url, e)))?;
        let document: WellKnownDocument = serde_json::from_str(&body)
            .map_err(|e| ClientError::discovery(format!("smart-configuration is not valid JSON: {}", e)))?;

        SmartConfiguration::try_from(document)
    }
}
