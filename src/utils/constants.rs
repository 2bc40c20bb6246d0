//! Shared constants and invariants

pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 10;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

// Client assertion
pub const DEFAULT_JWT_LIFETIME_SECS: u64 = 300;
pub const MAX_JWT_LIFETIME_SECS: u64 = 300;
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
pub const PRIVATE_KEY_JWT: &str = "private_key_jwt";

// PKCE / state
pub const PKCE_VERIFIER_BYTES: usize = 32;
pub const STATE_BYTES: usize = 16;

// Authorization code exchange without `expires_in`
pub const DEFAULT_SESSION_TOKEN_TTL_SECS: u64 = 300;

pub const SMART_CONFIGURATION_PATH: &str = "/.well-known/smart-configuration";
pub const FHIR_JSON: &str = "application/fhir+json";
