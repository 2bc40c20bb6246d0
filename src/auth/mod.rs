//! Auth module
//!
//! Token acquisition for the SMART flows: discovery, PKCE, signed client
//! assertions, the token lifecycle manager and the authorization code flow.

use crate::errors::Result;

pub mod assertion;
pub mod authorization_code;
pub mod discovery;
pub mod pkce;
pub mod token_manager;

/// Source of bearer tokens for outgoing FHIR requests.
pub trait AccessTokenProvider: Send + Sync {
    /// `force_refresh` bypasses any cached token.
    fn access_token(
        &self,
        force_refresh: bool,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}
