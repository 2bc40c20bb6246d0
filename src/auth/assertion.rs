//! Signed client assertions (RFC 7523) for the `private_key_jwt` token
//! endpoint authentication used by SMART Backend Services.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::client::{BackendConfig, KeyFormat};
use crate::errors::{ClientError, Result};
use crate::helpers::time::now_i64;

/// Claims of a client assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    /// client_id
    pub iss: String,
    /// client_id
    pub sub: String,
    /// token endpoint URL
    pub aud: String,
    /// unique per assertion
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Private key in JWK form. Only the members needed for import are read.
#[derive(Debug, Deserialize)]
struct PrivateJwk {
    kty: String,
    kid: Option<String>,
    crv: Option<String>,
    n: Option<String>,
    e: Option<String>,
    d: Option<String>,
    p: Option<String>,
    q: Option<String>,
}

/// Signs a fresh assertion addressed to `audience` (the token endpoint).
pub fn sign_client_assertion(
    client_id: &str,
    backend: &BackendConfig,
    key_material: &str,
    audience: &str,
) -> Result<String> {
    let (encoding_key, jwk_kid) = import_key(backend.key_format, backend.algorithm, key_material)?;

    let mut header = Header::new(backend.algorithm);
    header.typ = Some("JWT".to_string());
    header.kid = backend.key_id.clone().or(jwk_kid);
    header.jku = backend.jwks_url.clone();

    let issuer = backend.assertion_issuer(client_id);
    let iat = now_i64();
    let claims = ClientAssertionClaims {
        iss: issuer.to_string(),
        sub: issuer.to_string(),
        aud: audience.to_string(),
        jti: uuid::Uuid::new_v4().to_string(),
        iat,
        exp: iat + backend.jwt_lifetime_seconds as i64,
    };

    debug!(alg = ?backend.algorithm, kid = ?header.kid, "signing client assertion");
    encode(&header, &claims, &encoding_key)
        .map_err(|e| ClientError::authentication(format!("failed to sign client assertion: {}", e)))
}

/// Returns the signing key and, for JWK input, its `kid`.
pub fn import_key(format: KeyFormat, algorithm: Algorithm, key_material: &str) -> Result<(EncodingKey, Option<String>)> {
    match format {
        KeyFormat::Pem => Ok((import_pem(algorithm, key_material.as_bytes())?, None)),
        KeyFormat::Jwk => import_jwk(algorithm, key_material),
    }
}

fn import_pem(algorithm: Algorithm, pem: &[u8]) -> Result<EncodingKey> {
    let imported = match algorithm {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
        other => return Err(unsupported_algorithm(other)),
    };
    imported.map_err(|e| ClientError::authentication(format!("failed to import {:?} PEM key: {}", algorithm, e)))
}

fn import_jwk(algorithm: Algorithm, key_material: &str) -> Result<(EncodingKey, Option<String>)> {
    let jwk: PrivateJwk = serde_json::from_str(key_material)
        .map_err(|e| ClientError::authentication(format!("private key is not a valid JWK: {}", e)))?;

    let pem = match (jwk.kty.as_str(), algorithm) {
        (
            "RSA",
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512,
        ) => rsa_jwk_to_pem(&jwk)?,
        ("EC", Algorithm::ES384) => ec_jwk_to_pem(&jwk)?,
        (kty, algorithm) => {
            return Err(ClientError::authentication(format!(
                "JWK of type '{}' (crv {:?}) cannot sign {:?}",
                kty, jwk.crv, algorithm
            )))
        }
    };

    Ok((import_pem(algorithm, pem.as_bytes())?, jwk.kid))
}

fn rsa_jwk_to_pem(jwk: &PrivateJwk) -> Result<String> {
    let n = jwk_uint("n", &jwk.n)?;
    let e = jwk_uint("e", &jwk.e)?;
    let d = jwk_uint("d", &jwk.d)?;
    let p = jwk_uint("p", &jwk.p)?;
    let q = jwk_uint("q", &jwk.q)?;

    let key = RsaPrivateKey::from_components(n, e, d, vec![p, q])
        .map_err(|e| ClientError::authentication(format!("invalid RSA JWK: {}", e)))?;
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(|e| ClientError::authentication(format!("invalid RSA JWK: {}", e)))
}

fn ec_jwk_to_pem(jwk: &PrivateJwk) -> Result<String> {
    if jwk.crv.as_deref() != Some("P-384") {
        return Err(ClientError::authentication(format!(
            "EC JWK curve {:?} is not supported, expected P-384",
            jwk.crv
        )));
    }
    let d = jwk_bytes("d", &jwk.d)?;
    let secret = p384::SecretKey::from_slice(&d)
        .map_err(|e| ClientError::authentication(format!("invalid EC JWK: {}", e)))?;
    secret
        .to_pkcs8_pem(LineEnding::LF)
        .map(|pem| pem.as_str().to_owned())
        .map_err(|e| ClientError::authentication(format!("invalid EC JWK: {}", e)))
}

fn jwk_bytes(member: &str, value: &Option<String>) -> Result<Vec<u8>> {
    let encoded = value
        .as_deref()
        .ok_or_else(|| ClientError::authentication(format!("JWK is missing '{}'", member)))?;
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| ClientError::authentication(format!("JWK member '{}' is not base64url: {}", member, e)))
}

fn jwk_uint(member: &str, value: &Option<String>) -> Result<BigUint> {
    jwk_bytes(member, value).map(|bytes| BigUint::from_bytes_be(&bytes))
}

fn unsupported_algorithm(algorithm: Algorithm) -> ClientError {
    ClientError::authentication(format!("{:?} cannot be used for client assertions", algorithm))
}
