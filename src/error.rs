use thiserror::Error;

/// Why a bearer token's expiry could not be read. Callers treat every
/// variant as "expired".
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("token has {0} segments, expected 3")]
    SegmentCount(usize),

    #[error("token payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("token payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token payload has no numeric exp claim")]
    MissingExpiry,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("token refresh request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token refresh timed out")]
    Timeout,

    #[error("token refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token refresh response malformed: {0}")]
    Malformed(String),
}

/// Anything that can go wrong while reconstructing the session at startup.
/// Never escapes `SessionManager::restore`.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Session expired, please log in again")]
    Unauthorized,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    #[error("{context} ({status}): {body}")]
    Status {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ApiError {
    /// HTTP status a gateway handler should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotAuthenticated | ApiError::Unauthorized | ApiError::InvalidCredentials => 401,
            ApiError::Validation(_) => 400,
            ApiError::Status { status, .. } if *status >= 400 && *status < 500 => *status,
            ApiError::Status { .. } | ApiError::Request(_) => 502,
        }
    }
}
