//! error kinds surfaced by a recommendation request.
//!
//! request-level failures are classified once into an [`ErrorKind`] and carry one fixed
//! user-facing message. per-line stream failures never get here; the decoder swallows them.

use serde::Deserialize;

use crate::preferences::Facet;

/// classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// http 401
    InvalidCredentials,
    /// http 429
    RateLimited,
    /// http 400
    InvalidRequest,
    /// http 500
    ServiceUnavailable,
    /// any other status or transport failure
    NetworkOrUnclassified,
    /// no api key configured; raised before touching the network
    ConfigurationMissing,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::InvalidCredentials,
            429 => Self::RateLimited,
            400 => Self::InvalidRequest,
            500 => Self::ServiceUnavailable,
            _ => Self::NetworkOrUnclassified,
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid API key. Please check your configuration.",
            Self::RateLimited => "Rate limit exceeded. Please try again later.",
            Self::InvalidRequest => {
                "The recommendation request was rejected. Please adjust your preferences and try again."
            }
            Self::ServiceUnavailable => {
                "The recommendation service is currently unavailable. Please try again later."
            }
            Self::NetworkOrUnclassified => "An error occurred while getting recommendations.",
            Self::ConfigurationMissing => {
                "No API key is configured. Set OPENAI_API_KEY and try again."
            }
        }
    }
}

/// a failed request: the classification plus whatever detail the provider or transport gave us.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl RequestError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    pub fn network(detail: impl ToString) -> Self {
        Self::new(ErrorKind::NetworkOrUnclassified, detail.to_string())
    }

    pub fn missing_credentials() -> Self {
        Self::new(
            ErrorKind::ConfigurationMissing,
            "api key is not configured",
        )
    }

    /// classify a non-success http response.
    ///
    /// openai-style bodies look like `{ "error": { "message": "..." } }`; anything else
    /// still gets classified by status, with a generic detail.
    pub fn from_response(status: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorBody {
            error: Option<ErrorDetail>,
        }
        #[derive(Deserialize)]
        struct ErrorDetail {
            message: Option<String>,
        }

        let detail = match serde_json::from_str::<ErrorBody>(body) {
            Ok(ErrorBody { error: Some(ErrorDetail { message: Some(m) }) }) => m,
            Ok(_) => "Unknown error occurred".to_string(),
            Err(_) => "Failed to parse error response".to_string(),
        };
        Self::new(ErrorKind::from_status(status), format!("http {status}: {detail}"))
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }
}

/// a preference set that cannot be submitted yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreferenceError {
    #[error("missing required preferences: {}", .0.iter().map(|f| f.label()).collect::<Vec<_>>().join(", "))]
    Incomplete(Vec<Facet>),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to serialize stored value: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },
}
