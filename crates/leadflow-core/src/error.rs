use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the Leadflow system.
///
/// Storage and configuration failures surface here directly. Engine
/// subsystems define their own error types and wrap this one so that the
/// `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeadflowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Lead not found: {0}")]
    LeadNotFound(Uuid),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(Uuid),

    #[error("Concurrent modification of {entity} {id}")]
    VersionConflict { entity: &'static str, id: Uuid },
}

impl LeadflowError {
    /// Shorthand for a validation failure on a named field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        LeadflowError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for LeadflowError {
    fn from(err: toml::de::Error) -> Self {
        LeadflowError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for LeadflowError {
    fn from(err: toml::ser::Error) -> Self {
        LeadflowError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for LeadflowError {
    fn from(err: serde_json::Error) -> Self {
        LeadflowError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Leadflow operations.
pub type Result<T> = std::result::Result<T, LeadflowError>;
