//! # SMART on FHIR client library
//!
//! Obtains and keeps OAuth2 access tokens for a SMART server and uses them
//! to drive a FHIR REST client.
//!
//! Modules:
//! - `auth`: discovery, PKCE authorization code flow, signed client assertions, token lifecycle
//! - `cache`: the per-client token cache
//! - `config`: YAML configuration, secrets and validation
//! - `fhir`: authenticated requests, reference resolution, Bundle paging
//! - `resilience`: the bounded retry on 401

pub mod auth;
pub mod cache;
pub mod config;
pub mod errors;
pub mod fhir;
pub mod helpers;
pub mod observability;
pub mod resilience;
pub mod utils;

#[cfg(test)]
mod tests;

pub use crate::auth::authorization_code::{AuthenticatedSession, AuthorizeOptions, AuthorizeRequest, SessionTokens};
pub use crate::auth::discovery::SmartConfiguration;
pub use crate::auth::token_manager::TokenManager;
pub use crate::auth::AccessTokenProvider;
pub use crate::config::client::{AgentConfig, BackendConfig, ClientConfig, KeyFormat, SecretValue};
pub use crate::errors::{ClientError, Result};
pub use crate::fhir::client::FhirClient;
pub use crate::fhir::paginator::{BundleItems, BundlePages, PageSource};
pub use crate::fhir::references::{ReferenceCache, ReferenceEntry, ResolveMode};
