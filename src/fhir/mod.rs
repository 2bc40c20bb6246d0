//! FHIR module
//!
//! Authenticated REST client plus the two traversals built on it:
//! reference resolution and Bundle pagination.

pub mod client;
pub mod outcome;
pub mod paginator;
pub mod references;
