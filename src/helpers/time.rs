use chrono::Utc;
use tokio::time::Instant;

pub fn now_i64() -> i64 {
    Utc::now().timestamp()
}

pub fn get_instant() -> Instant {
    Instant::now()
}

/// Absolute expiry for a token issued now with the given lifetime.
pub fn expires_at(expires_in_seconds: u64) -> i64 {
    now_i64().saturating_add(expires_in_seconds as i64)
}
