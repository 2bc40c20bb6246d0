// tests/common/mod.rs
pub use axum::Router;
pub use serde_json::json;
pub use tokio::task::JoinHandle;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::routing::{get, post};
use axum::{Form, Json};
use reqwest::Client;
use serde_json::Value;

use crate::auth::AccessTokenProvider;
use crate::config::client::{BackendConfig, ClientConfig, KeyFormat, SecretValue};
use crate::errors::Result;
use crate::fhir::client::FhirClient;

pub const CLIENT_ID: &str = "backend-client";
pub const RSA_PRIVATE_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/tests/fixtures/rsa_private.pem");
pub const RSA_PUBLIC_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/tests/fixtures/rsa_public.pem");
pub const RSA_PRIVATE_JWK: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/tests/fixtures/rsa_private.jwk.json");

/// Spawn an Axum router on an ephemeral port and return (JoinHandle, SocketAddr)
pub async fn spawn_axum(router: Router) -> (JoinHandle<()>, SocketAddr) {
    spawn_axum_with(|_| router).await
}

/// Like `spawn_axum`, for routers that must know their own address.
pub async fn spawn_axum_with<F>(build: F) -> (JoinHandle<()>, SocketAddr)
where
    F: FnOnce(SocketAddr) -> Router,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().unwrap();
    let router = build(addr);
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server failed");
    });
    (handle, addr)
}

/// Well-known document plus a token endpoint at `/auth/token` that records
/// every form and answers `token_body` with `access_token = access-{n}`.
pub fn smart_router(addr: SocketAddr, forms: FormLog, token_body: Value) -> Router {
    let configuration = json!({
        "issuer": format!("http://{}/auth", addr),
        "authorization_endpoint": format!("http://{}/auth/authorize", addr),
        "token_endpoint": format!("http://{}/auth/token", addr),
        "token_endpoint_auth_methods_supported": ["private_key_jwt"],
        "token_endpoint_auth_signing_alg_values_supported": ["RS384", "ES384"],
        "code_challenge_methods_supported": ["S256"]
    });

    Router::new()
        .route(
            "/.well-known/smart-configuration",
            get(move || {
                let configuration = configuration.clone();
                async move { Json(configuration) }
            }),
        )
        .route(
            "/auth/token",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let forms = forms.clone();
                let mut body = token_body.clone();
                async move {
                    forms.push(form);
                    body["access_token"] = json!(format!("access-{}", forms.len()));
                    Json(body)
                }
            }),
        )
}

pub fn build_reqwest_client() -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .expect("reqwest client")
}

/// Form bodies seen by a mock token endpoint, in arrival order.
#[derive(Clone, Default)]
pub struct FormLog(pub Arc<Mutex<Vec<HashMap<String, String>>>>);

impl FormLog {
    pub fn push(&self, form: HashMap<String, String>) {
        self.0.lock().unwrap().push(form);
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn last(&self) -> HashMap<String, String> {
        self.0.lock().unwrap().last().cloned().expect("no form captured")
    }
}

/// Client config against a server spawned at `addr`, FHIR base under `/fhir`.
pub fn client_config(addr: SocketAddr, backend: Option<BackendConfig>) -> ClientConfig {
    ClientConfig {
        client_id: CLIENT_ID.to_string(),
        issuer: format!("http://{}/auth", addr),
        fhir_base_url: format!("http://{}/fhir", addr),
        scope: "system/*.read".to_string(),
        redirect_uri: Some("http://app.test/callback".to_string()),
        backend,
    }
}

pub fn rsa_backend() -> BackendConfig {
    BackendConfig::new(
        SecretValue::FromFile {
            path: RSA_PRIVATE_PEM.to_string(),
        },
        KeyFormat::Pem,
    )
}

/// Hands out `stale` until asked to refresh, then `fresh`.
#[derive(Default)]
pub struct StaticTokens {
    pub calls: AtomicUsize,
    pub forced: AtomicUsize,
}

impl StaticTokens {
    pub const STALE: &'static str = "stale-token";
    pub const FRESH: &'static str = "fresh-token";

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }
}

impl AccessTokenProvider for StaticTokens {
    async fn access_token(&self, force_refresh: bool) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
            Ok(Self::FRESH.to_string())
        } else {
            Ok(Self::STALE.to_string())
        }
    }
}

/// FHIR client rooted at `{base_url}` with a `StaticTokens` provider.
pub fn static_fhir_client(base_url: &str) -> (FhirClient<StaticTokens>, Arc<StaticTokens>) {
    let tokens = Arc::new(StaticTokens::default());
    let client = FhirClient::new(base_url, build_reqwest_client(), tokens.clone()).expect("fhir client");
    (client, tokens)
}
