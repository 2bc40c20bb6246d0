//! Configuration validation with aggregated errors.
//! - Aggregates all issues into Vec<String>
//! - Validates the client invariants:
//!   * absolute http(s) URLs for issuer / FHIR base / redirect / jku
//!   * asymmetric signing algorithm and bounded assertion lifetime
//!   * assertion issuer equal to client_id
//!   * declared key format matches the key material

use jsonwebtoken::Algorithm;
use tracing::{error, info};
use url::Url;

use crate::config::client::{BackendConfig, ClientConfig, KeyFormat};
use crate::config::settings::SettingsConfig;
use crate::errors::ClientError;
use crate::observability::metrics::get_metrics;
use crate::utils::constants::MAX_JWT_LIFETIME_SECS;

/// Public entrypoint: returns Ok(()) or Err(Vec<String>) containing all issues.
pub fn validate_config(settings: &SettingsConfig, client: &ClientConfig) -> Result<(), Vec<String>> {
    let mut errors: Vec<String> = Vec::new();

    validate_settings(settings, &mut errors);
    validate_client(client, &mut errors);

    if errors.is_empty() {
        info!("config valid");
        Ok(())
    } else {
        error!("configuration validation errors ({}):", errors.len());
        for e in &errors {
            error!(" - {}", e);
        }
        get_metrics().config_validation_errors.inc();
        Err(errors)
    }
}

/// Same checks, folded into the library error type
pub fn ensure_valid(settings: &SettingsConfig, client: &ClientConfig) -> Result<(), ClientError> {
    validate_config(settings, client).map_err(|errors| {
        ClientError::initialization(format!(
            "config is not valid, total errors: {}, {}",
            errors.len(),
            errors.join("; ")
        ))
    })
}

/// SETTINGS VALIDATION
fn validate_settings(settings: &SettingsConfig, errors: &mut Vec<String>) {
    if let Some(s) = settings.safety_margin_seconds {
        if s > 60 * 60 * 24 {
            errors.push(format!("settings.safety_margin_seconds ({}) is unreasonably large", s));
        }
    }

    if settings.http_timeout_ms == Some(0) {
        errors.push("settings.http_timeout_ms must be > 0".to_string());
    }

    if let Some(logging) = &settings.logging {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&logging.level.to_lowercase().as_str()) {
            errors.push(format!(
                "settings.logging.level '{}' invalid; allowed: {:?}",
                logging.level, valid
            ));
        }
    }
}

/// CLIENT VALIDATION
fn validate_client(client: &ClientConfig, errors: &mut Vec<String>) {
    if client.client_id.trim().is_empty() {
        errors.push("client.client_id cannot be empty".to_string());
    }

    validate_url("client.issuer", &client.issuer, errors);
    validate_url("client.fhir_base_url", &client.fhir_base_url, errors);
    if let Some(redirect_uri) = &client.redirect_uri {
        validate_url("client.redirect_uri", redirect_uri, errors);
    }

    if let Some(backend) = &client.backend {
        validate_backend(&client.client_id, backend, errors);
    }
}

fn validate_backend(client_id: &str, backend: &BackendConfig, errors: &mut Vec<String>) {
    if !is_asymmetric(backend.algorithm) {
        errors.push(format!(
            "client.backend.algorithm {:?} is not an asymmetric algorithm",
            backend.algorithm
        ));
    }

    if backend.jwt_lifetime_seconds == 0 || backend.jwt_lifetime_seconds > MAX_JWT_LIFETIME_SECS {
        errors.push(format!(
            "client.backend.jwt_lifetime_seconds ({}) must be in 1..={}",
            backend.jwt_lifetime_seconds, MAX_JWT_LIFETIME_SECS
        ));
    }

    let issuer = backend.assertion_issuer(client_id);
    if issuer != client_id {
        errors.push(format!(
            "client.backend.jwt_issuer '{}' must equal client_id '{}'",
            issuer, client_id
        ));
    }

    if let Some(jwks_url) = &backend.jwks_url {
        validate_url("client.backend.jwks_url", jwks_url, errors);
    }

    match backend.private_key.resolve() {
        Ok(key) => validate_key_material(&key, backend.key_format, errors),
        Err(err) => errors.push(format!("client.backend.private_key: {}", err)),
    }
}

fn validate_key_material(key: &str, key_format: KeyFormat, errors: &mut Vec<String>) {
    match key_format {
        KeyFormat::Jwk => {
            let is_object = serde_json::from_str::<serde_json::Value>(key)
                .map(|value| value.is_object())
                .unwrap_or(false);
            if !is_object {
                errors.push("client.backend.private_key is declared jwk but is not a JSON object".to_string());
            }
        }
        KeyFormat::Pem => {
            if !key.contains("-----BEGIN") {
                errors.push("client.backend.private_key is declared pem but has no PEM armor".to_string());
            }
        }
    }
}

fn validate_url(path: &str, value: &str, errors: &mut Vec<String>) {
    match Url::parse(value) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
        Ok(url) => errors.push(format!("{} '{}' has unsupported scheme '{}'", path, value, url.scheme())),
        Err(err) => errors.push(format!("{} '{}' is not an absolute URL: {}", path, value, err)),
    }
}

pub fn is_asymmetric(algorithm: Algorithm) -> bool {
    !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}
