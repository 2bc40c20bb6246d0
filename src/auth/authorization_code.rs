use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::auth::pkce::{generate_state, PkceChallenge};
use crate::auth::token_manager::{TokenManager, GRANT_AUTHORIZATION_CODE};
use crate::auth::AccessTokenProvider;
use crate::cache::token::CachedToken;
use crate::cache::token_cache::TokenCache;
use crate::errors::{ClientError, Result};
use crate::fhir::client::FhirClient;

/// Per-call overrides of the configured authorization request.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    /// EHR launch token
    pub launch: Option<String>,
    pub scope: Option<String>,
    pub redirect_uri: Option<String>,
}

/// Everything the caller must keep until the redirect comes back.
///
/// `code_verifier` and `state` are single use; persisting them against the
/// pending session is the caller's job.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest {
    pub authorize_url: String,
    pub code_verifier: String,
    pub state: String,
}

/// Result of a successful code exchange. Requests made through `fhir` carry
/// the session's own bearer token, never one of the backend flow.
#[derive(Debug, Clone)]
pub struct AuthenticatedSession {
    pub server_url: Url,
    pub access_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Decoded `id_token` payload. The signature is NOT verified.
    pub id_token_claims: Option<Value>,
    pub patient: Option<String>,
    pub encounter: Option<String>,
    /// shared with `fhir`
    pub tokens: Arc<SessionTokens>,
    pub fhir: FhirClient<SessionTokens>,
}

impl AuthenticatedSession {
    /// `fhirUser` claim of the unverified id_token
    pub fn fhir_user(&self) -> Option<&str> {
        self.id_token_claims.as_ref()?.get("fhirUser")?.as_str()
    }
}

/// Token slot of one authenticated session.
///
/// Starts with the exchanged token. A stale or rejected token is replaced
/// with the session's `refresh_token`; without one the session has ended.
#[derive(Debug)]
pub struct SessionTokens {
    manager: Arc<TokenManager>,
    cache: TokenCache,
}

impl SessionTokens {
    async fn new(manager: Arc<TokenManager>, token: CachedToken) -> Self {
        let cache = TokenCache::new();
        cache.set(token).await;
        Self { manager, cache }
    }

    pub async fn current(&self) -> Option<CachedToken> {
        self.cache.get().await
    }
}

impl AccessTokenProvider for SessionTokens {
    async fn access_token(&self, force_refresh: bool) -> Result<String> {
        if !force_refresh {
            if let Some(token) = self.cache.get_fresh().await {
                return Ok(token.access_token);
            }
        }

        let refresh_token = self
            .cache
            .get()
            .await
            .and_then(|token| token.refresh_token)
            .ok_or_else(|| ClientError::authentication("session token is no longer usable and no refresh_token was issued"))?;
        let token = self.manager.request_refresh(refresh_token).await?;
        let access_token = token.access_token.clone();
        self.cache.set(token).await;
        Ok(access_token)
    }
}

impl TokenManager {
    /// Builds the authorization URL with a fresh PKCE pair and state.
    pub async fn authorize(&self, options: AuthorizeOptions) -> Result<AuthorizeRequest> {
        let config = self.config();
        let redirect_uri = options
            .redirect_uri
            .or_else(|| config.redirect_uri.clone())
            .ok_or_else(|| ClientError::initialization("redirect_uri is required for the authorization code flow"))?;

        let smart = self.discover().await?;
        let endpoint = smart
            .authorization_endpoint
            .as_deref()
            .ok_or_else(|| ClientError::discovery("smart-configuration has no authorization_endpoint"))?;
        let mut authorize_url = Url::parse(endpoint)
            .map_err(|e| ClientError::discovery(format!("invalid authorization_endpoint '{}': {}", endpoint, e)))?;

        let pkce = PkceChallenge::generate();
        let state = generate_state();
        let scope = options.scope.unwrap_or_else(|| config.scope.clone());

        {
            let mut query = authorize_url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &config.client_id)
                .append_pair("redirect_uri", &redirect_uri)
                .append_pair("scope", &scope)
                .append_pair("state", &state)
                .append_pair("aud", &config.issuer)
                .append_pair("code_challenge", &pkce.code_challenge)
                .append_pair("code_challenge_method", pkce.method());
            if let Some(launch) = &options.launch {
                query.append_pair("launch", launch);
            }
        }

        info!("authorization request prepared for client '{}'", config.client_id);
        Ok(AuthorizeRequest {
            authorize_url: authorize_url.to_string(),
            code_verifier: pkce.code_verifier,
            state,
        })
    }

    /// Validates the redirect and trades its code for a token.
    ///
    /// The state check happens before any network traffic.
    pub async fn exchange(
        self: &Arc<Self>,
        callback_url: &str,
        expected_state: &str,
        code_verifier: &str,
    ) -> Result<AuthenticatedSession> {
        let callback = parse_callback(callback_url)?;

        if callback.state.as_deref() != Some(expected_state) {
            return Err(ClientError::authentication("Invalid state"));
        }
        if let Some(error) = callback.error {
            return Err(ClientError::authentication(match callback.error_description {
                Some(description) => format!("authorization denied: {}: {}", error, description),
                None => format!("authorization denied: {}", error),
            }));
        }
        let code = callback
            .code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| ClientError::authentication("Missing code"))?;

        let config = self.config();
        let redirect_uri = config
            .redirect_uri
            .clone()
            .ok_or_else(|| ClientError::initialization("redirect_uri is required for the authorization code flow"))?;

        let smart = self.discover().await?;
        let form = vec![
            ("grant_type", GRANT_AUTHORIZATION_CODE.to_string()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", config.client_id.clone()),
            ("code_verifier", code_verifier.to_string()),
        ];
        let response = self
            .post_token_endpoint(&smart.token_endpoint, GRANT_AUTHORIZATION_CODE, &form)
            .await?;

        let cached = self.cached_from_response(response.clone(), None)?;
        // a backend manager keeps its slot for client_credentials tokens
        if config.backend.is_none() {
            self.store(cached.clone()).await;
        }

        let tokens = Arc::new(SessionTokens::new(self.clone(), cached.clone()).await);
        let fhir = FhirClient::new(&config.fhir_base_url, self.http_client().clone(), tokens.clone())?;
        let id_token_claims = response.id_token.as_deref().and_then(decode_claims_unverified);
        info!("authorization code exchanged, session bound to {}", fhir.base_url());

        Ok(AuthenticatedSession {
            server_url: fhir.base_url().clone(),
            access_token: cached.access_token,
            token_type: response.token_type,
            scope: cached.scope,
            refresh_token: cached.refresh_token,
            id_token: response.id_token,
            id_token_claims,
            patient: response.patient,
            encounter: response.encounter,
            tokens,
            fhir,
        })
    }
}

#[derive(Debug, Default)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Accepts an absolute redirect URL or just its path and query.
fn parse_callback(callback_url: &str) -> Result<CallbackParams> {
    let url = Url::parse(callback_url)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(callback_url)))
        .map_err(|e| ClientError::authentication(format!("invalid callback url: {}", e)))?;

    let mut params = CallbackParams::default();
    for (key, value) in url.query_pairs() {
        let value = Some(value.into_owned());
        match key.as_ref() {
            "code" => params.code = value,
            "state" => params.state = value,
            "error" => params.error = value,
            "error_description" => params.error_description = value,
            _ => {}
        }
    }
    Ok(params)
}

/// Payload of a compact JWT, without any signature check.
pub fn decode_claims_unverified(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .inspect_err(|e| warn!("id_token payload is not base64url: {}", e))
        .ok()?;
    serde_json::from_slice(&decoded)
        .inspect_err(|e| warn!("id_token payload is not JSON: {}", e))
        .ok()
}
