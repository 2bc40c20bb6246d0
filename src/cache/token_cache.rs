use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::cache::token::CachedToken;

/// Single authoritative token slot of one client instance.
///
/// Writers are not serialized: two refreshes in flight both store their
/// result and the later one wins.
#[derive(Debug, Clone, Default)]
pub struct TokenCache {
    inner: Arc<RwLock<Option<CachedToken>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: CachedToken) {
        debug!("token cached, expires_at: {}", token.expires_at);
        *self.inner.write().await = Some(token);
    }

    /// Token if present and not within the safety margin of its expiry
    pub async fn get_fresh(&self) -> Option<CachedToken> {
        self.inner
            .read()
            .await
            .as_ref()
            .filter(|token| token.is_fresh())
            .cloned()
    }

    /// Whatever is stored, stale or not
    pub async fn get(&self) -> Option<CachedToken> {
        self.inner.read().await.clone()
    }
}
