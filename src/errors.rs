use http::StatusCode;
use serde_json::Value;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Failure taxonomy shared by the token flows and the FHIR REST client.
///
/// `Clone` so that a single in-flight reference fetch can hand the same
/// outcome to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Invalid configuration detected while building a client.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// The well-known SMART configuration could not be fetched or is unusable.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// State mismatch, missing code, signing failure, token endpoint
    /// rejection or a 401 that survived a forced token refresh.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Non-2xx answer from the FHIR server.
    #[error("request failed with {status}: {message}")]
    Request {
        status: StatusCode,
        message: String,
        /// OperationOutcome payload, when the server sent one.
        outcome: Option<Value>,
    },

    /// Network level failure of a FHIR call.
    #[error("transport error: {0}")]
    Transport(String),

    /// A 2xx answer whose body is not the expected JSON.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery(message.into())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// HTTP status carried by a `Request` error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}
