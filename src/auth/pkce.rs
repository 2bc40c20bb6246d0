//! PKCE (RFC 7636) verifier / S256 challenge pair and the opaque `state`
//! value of the authorization code flow.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::utils::constants::{PKCE_VERIFIER_BYTES, STATE_BYTES};

/// `length` bytes from the OS CSPRNG, base64url without padding.
pub fn generate_verifier(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(verifier)) without padding.
pub fn derive_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Random CSRF token echoed back by the authorization server.
pub fn generate_state() -> String {
    generate_verifier(STATE_BYTES)
}

#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// secret; sent only with the token request
    pub code_verifier: String,
    pub code_challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let code_verifier = generate_verifier(PKCE_VERIFIER_BYTES);
        let code_challenge = derive_challenge(&code_verifier);
        Self {
            code_verifier,
            code_challenge,
        }
    }

    pub fn method(&self) -> &'static str {
        "S256"
    }
}
