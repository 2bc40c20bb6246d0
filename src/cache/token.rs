use chrono::Utc;

/// Access token held by one token manager
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: i64, // UNIX TIMESTAMP
    /// token is considered stale from here on
    pub refresh_at: i64,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

impl CachedToken {
    pub fn new(access_token: String, expires_at: i64, safety_margin_seconds: u64) -> Self {
        let refresh_at = (expires_at - safety_margin_seconds as i64).max(0);
        Self {
            access_token,
            expires_at,
            refresh_at,
            refresh_token: None,
            scope: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        self.refresh_token = refresh_token;
        self
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    /// Usable without a token endpoint round trip
    pub fn is_fresh(&self) -> bool {
        Utc::now().timestamp() < self.refresh_at
    }
}
