//! Error taxonomy shared by every Leadflow crate.

use thiserror::Error;

/// Leadflow error type.
#[derive(Debug, Error)]
pub enum LeadflowError {
    /// Durable backend unreachable or a statement failed. Retried with backoff.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Durable backend rejected the write for authorization reasons.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Missing or malformed input (no phone, no email, empty script). Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Voice-call provider rejected or could not be reached.
    #[error("Provider error: {0}")]
    Provider(String),

    /// SMTP relay failure.
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level failure talking to an HTTP API.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LeadflowError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, LeadflowError::PermissionDenied(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, LeadflowError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, LeadflowError>;
