use std::sync::Arc;

use http::{header, Method, StatusCode};
use reqwest::{Client, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::token_manager::TokenManager;
use crate::auth::AccessTokenProvider;
use crate::errors::{ClientError, Result};
use crate::fhir::outcome::request_error;
use crate::helpers::time::get_instant;
use crate::observability::metrics::get_metrics;
use crate::resilience::retry::{run_with_auth_retry, Attempt};
use crate::utils::constants::FHIR_JSON;

/// FHIR REST client; every call carries a bearer token from `P`.
pub struct FhirClient<P> {
    http: Client,
    base_url: Url,
    tokens: Arc<P>,
}

impl<P> Clone for FhirClient<P> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            tokens: self.tokens.clone(),
        }
    }
}

impl<P> std::fmt::Debug for FhirClient<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirClient").field("base_url", &self.base_url.as_str()).finish()
    }
}

impl FhirClient<TokenManager> {
    /// Client for the configured FHIR base, sharing the manager's HTTP client.
    pub fn from_manager(manager: Arc<TokenManager>) -> Result<Self> {
        let base_url = manager.config().fhir_base_url.clone();
        let http = manager.http_client().clone();
        Self::new(&base_url, http, manager)
    }
}

impl<P> FhirClient<P>
where
    P: AccessTokenProvider + 'static,
{
    pub fn new(base_url: &str, http: Client, tokens: Arc<P>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| ClientError::initialization(format!("invalid FHIR base url '{}': {}", base_url, e)))?;
        // a trailing slash keeps the last path segment when joining
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url, tokens })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URLs pass through; anything else is relative to the base.
    pub fn resolve_url(&self, path: &str) -> Result<Url> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::initialization(format!("cannot resolve '{}' against {}: {}", path, self.base_url, e)))
    }

    /// Authenticated call; a 401 triggers exactly one retry with a forced
    /// token refresh.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = self.resolve_url(path)?;

        run_with_auth_retry(|attempt| {
            let url = url.clone();
            let method = method.clone();
            async move {
                let token = self.tokens.access_token(attempt.force_refresh()).await?;
                let response = self.send(method, url, &token, body).await?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    return Ok(Attempt::Unauthorized);
                }
                read_resource(response).await.map(Attempt::Success)
            }
        })
        .await
    }

    async fn send(&self, method: Method, url: Url, token: &str, body: Option<&Value>) -> Result<Response> {
        let metrics = get_metrics();
        let start = get_instant();
        debug!("{} {}", method, url);

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header(header::ACCEPT, FHIR_JSON);
        if let Some(body) = body {
            request = request
                .header(header::CONTENT_TYPE, FHIR_JSON)
                .body(serde_json::to_vec(body)?);
        }

        let sent = request.send().await;
        metrics
            .fhir_request_duration
            .with_label_values(&[method.as_str()])
            .observe(start.elapsed().as_secs_f64());
        let response = sent?;
        metrics
            .fhir_requests
            .with_label_values(&[method.as_str(), response.status().as_str()])
            .inc();
        Ok(response)
    }

    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Value> {
        self.request(Method::GET, &format!("{}/{}", resource_type, id), None).await
    }

    /// `GET {type}?{params}`; returns the first Bundle page.
    pub async fn search(&self, resource_type: &str, params: &[(&str, &str)]) -> Result<Value> {
        let mut url = self.resolve_url(resource_type)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        self.request(Method::GET, url.as_str(), None).await
    }

    pub async fn create(&self, resource: &Value) -> Result<Value> {
        let resource_type = resource_type_of(resource)?;
        self.request(Method::POST, resource_type, Some(resource)).await
    }

    pub async fn update(&self, resource: &Value) -> Result<Value> {
        let resource_type = resource_type_of(resource)?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::InvalidResponse("resource to update has no id".into()))?;
        self.request(Method::PUT, &format!("{}/{}", resource_type, id), Some(resource)).await
    }

    pub async fn delete(&self, resource_type: &str, id: &str) -> Result<Value> {
        self.request(Method::DELETE, &format!("{}/{}", resource_type, id), None).await
    }
}

/// 2xx: parsed JSON body (`Null` when empty); otherwise a `RequestError`.
async fn read_resource(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(request_error(status, &text));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| ClientError::InvalidResponse(format!("{} body is not JSON: {}", status, e)))
}

fn resource_type_of(resource: &Value) -> Result<&str> {
    resource
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::InvalidResponse("resource has no resourceType".into()))
}
