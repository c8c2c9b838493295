//! Error types for vigil-rs.

use thiserror::Error;

/// Application result type.
pub type AppResult<T> = Result<T, AppError>;

/// Application error type.
#[derive(Debug, Error)]
pub enum AppError {
    // === Client Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Credential mismatch")]
    CredentialMismatch,

    #[error("Invalid or expired challenge")]
    InvalidOrExpiredChallenge,

    // === Server Errors ===
    #[error("Credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed stored data: {0}")]
    MalformedStoredData(String),

    #[error("Setup failed")]
    SetupFailure,

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns the error code for structured logs and API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::CredentialMismatch => "CREDENTIAL_MISMATCH",
            Self::InvalidOrExpiredChallenge => "INVALID_OR_EXPIRED_CHALLENGE",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::MalformedStoredData(_) => "MALFORMED_STORED_DATA",
            Self::SetupFailure => "SETUP_FAILURE",
            Self::Crypto(_) => "CRYPTO_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns whether this error should be logged at error level.
    #[must_use]
    pub const fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::MalformedStoredData(_)
                | Self::SetupFailure
                | Self::Crypto(_)
                | Self::Config(_)
                | Self::Internal(_)
        )
    }
}

// === From implementations ===

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
