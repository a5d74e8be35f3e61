//! Error types for the consultation service.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Whether a failed call is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::Timeout { .. }
        )
    }
}

/// Push-notification errors. Never fatal to a workflow instance.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Connection {0} is not live")]
    ConnectionGone(String),

    #[error("Connection {0} has expired")]
    ConnectionExpired(String),

    #[error("Failed to encode push payload: {0}")]
    Encode(String),

    #[error("Connection lookup failed: {0}")]
    Lookup(#[from] DatabaseError),
}

/// Workflow errors, following the caller-facing taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Caller input malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Analysis service or directory lookup failed.
    #[error("External service {service} failed: {reason}")]
    ExternalService { service: String, reason: String },

    /// Unknown conversation identifier.
    #[error("Conversation {0} not found")]
    NotFound(String),

    /// Conversation status may not move as requested.
    #[error("Conversation {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DatabaseError> for WorkflowError {
    fn from(e: DatabaseError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<LlmError> for WorkflowError {
    fn from(e: LlmError) -> Self {
        Self::ExternalService {
            service: "analysis".to_string(),
            reason: e.to_string(),
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
