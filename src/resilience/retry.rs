use std::future::Future;

use tracing::{error, warn};

use crate::errors::{ClientError, Result};
use crate::observability::metrics::get_metrics;

/// Position in the bounded auth retry:
/// `Initial -> (401) -> Refreshed -> (401) -> escalate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAttempt {
    Initial,
    Refreshed,
}

impl AuthAttempt {
    /// Whether the token for this attempt must bypass the cache.
    pub fn force_refresh(self) -> bool {
        matches!(self, AuthAttempt::Refreshed)
    }

    /// Next state after a 401; `None` once the single retry is spent.
    pub fn on_unauthorized(self) -> Option<Self> {
        match self {
            AuthAttempt::Initial => Some(AuthAttempt::Refreshed),
            AuthAttempt::Refreshed => None,
        }
    }
}

/// What one attempt produced.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Unauthorized,
}

/// Runs `operation` once, and once more with a forced token refresh if the
/// first run was rejected with 401. Any other failure is returned as is.
pub async fn run_with_auth_retry<F, Fut, T>(mut operation: F) -> Result<T>
where
    F: FnMut(AuthAttempt) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let mut attempt = AuthAttempt::Initial;
    loop {
        match operation(attempt).await? {
            Attempt::Success(value) => return Ok(value),
            Attempt::Unauthorized => match attempt.on_unauthorized() {
                Some(next) => {
                    warn!("request rejected with 401, retrying once with a refreshed token");
                    get_metrics().auth_retries.inc();
                    attempt = next;
                }
                None => {
                    error!("request rejected with 401 after a forced token refresh");
                    return Err(ClientError::authentication(
                        "request rejected with 401 after a forced token refresh",
                    ));
                }
            },
        }
    }
}
