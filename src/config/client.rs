use std::{env, fs};

use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::config::settings::SettingsConfig;
use crate::errors::{ClientError, Result};
use crate::utils::constants::DEFAULT_JWT_LIFETIME_SECS;

/// ================================
/// Full agent configuration
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default)]
    pub settings: SettingsConfig,
    pub client: ClientConfig,
}

/// ================================
/// SMART client
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    /// SMART server (authorization `aud`, discovery origin)
    pub issuer: String,
    /// FHIR REST base every request path is resolved against
    pub fhir_base_url: String,
    #[serde(default)]
    pub scope: String,
    /// required by the authorization code flow only
    pub redirect_uri: Option<String>,
    /// present when the client authenticates with a signed client assertion
    pub backend: Option<BackendConfig>,
}

/// Asymmetric client authentication (private_key_jwt)
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub private_key: SecretValue,
    #[serde(default)]
    pub key_format: KeyFormat,
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    #[serde(default = "default_jwt_lifetime")]
    pub jwt_lifetime_seconds: u64,
    /// `kid` header
    pub key_id: Option<String>,
    /// `jku` header
    pub jwks_url: Option<String>,
    /// signs `iss`/`sub`; must equal `client_id`
    pub jwt_issuer: Option<String>,
}

/// Where a secret comes from
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum SecretValue {
    Literal { value: String },
    FromEnv { from_env: String },
    FromFile { path: String },
}

impl SecretValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            SecretValue::Literal { value } => Ok(value.to_owned()),
            SecretValue::FromEnv { from_env } => env::var(from_env).map_err(|err| {
                ClientError::initialization(format!("env var '{}' is not readable: {}", from_env, err))
            }),
            SecretValue::FromFile { path } => fs::read_to_string(path)
                .map(|content| content.trim().to_string())
                .map_err(|err| ClientError::initialization(format!("key file '{}' is not readable: {}", path, err))),
        }
    }
}

/// Declared encoding of the private key
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    /// PKCS#8 / PKCS#1 / SEC1 PEM
    #[default]
    Pem,
    /// private JWK (RSA or P-384)
    Jwk,
}

fn default_algorithm() -> Algorithm {
    Algorithm::RS384
}

fn default_jwt_lifetime() -> u64 {
    DEFAULT_JWT_LIFETIME_SECS
}

impl BackendConfig {
    pub fn new(private_key: SecretValue, key_format: KeyFormat) -> Self {
        Self {
            private_key,
            key_format,
            algorithm: default_algorithm(),
            jwt_lifetime_seconds: default_jwt_lifetime(),
            key_id: None,
            jwks_url: None,
            jwt_issuer: None,
        }
    }

    /// `iss` and `sub` of the client assertion: `jwt_issuer` when set,
    /// otherwise `client_id`.
    pub fn assertion_issuer<'a>(&'a self, client_id: &'a str) -> &'a str {
        self.jwt_issuer.as_deref().unwrap_or(client_id)
    }
}
