use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum MnemoError {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("value must not be empty")]
    EmptyValue,

    #[error("invalid key '{0}': expected <category>(.<segment>)+")]
    InvalidKey(String),

    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("malformed transcript: {0}")]
    MalformedTranscript(String),

    #[error("extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    #[error("embedding backend error: {0}")]
    EmbedBackend(String),

    #[error("embedding dimension mismatch: store has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("lock held by pid {0}")]
    LockHeld(u32),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("store integrity: {0}")]
    StoreIntegrity(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MnemoError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) | Self::StoreIntegrity(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ExtractorUnavailable(_) | Self::EmbedBackend(_) => StatusCode::BAD_GATEWAY,
            Self::LockHeld(_) | Self::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Transient failures are retried on the next invocation and are never
    /// fatal to the calling host. Everything else is either a data problem
    /// (item dropped, ledger advanced) or a real fault.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExtractorUnavailable(_)
                | Self::EmbedBackend(_)
                | Self::LockHeld(_)
                | Self::ResourceExhausted(_)
        )
    }

    /// CLI exit code: 1 = usage/fatal, 2 = transient (skip & continue).
    pub fn exit_code(&self) -> i32 {
        if self.is_transient() {
            2
        } else {
            1
        }
    }
}

impl axum::response::IntoResponse for MnemoError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
