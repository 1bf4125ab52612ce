//! Domain errors for the compliance agent.

use thiserror::Error;

/// Domain-level errors that can occur in the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Compliance module not found: {0}")]
    ModuleNotFound(String),

    #[error("Failed to load compliance module '{identifier}': {reason}")]
    ModuleLoadFailed { identifier: String, reason: String },

    #[error("Subsystem not available: {0}")]
    SubsystemUnset(String),

    #[error("Queue operation failed: {0}")]
    QueueFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Installer error: {0}")]
    InstallerFailed(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::PersistenceError(err.to_string())
    }
}
