//! Structured error type for the agent turn engine.
//!
//! One `thiserror` variant per recoverable failure mode, `From` impls for
//! the handful of upstream error types we actually cross, and no variant
//! that swallows context as a bare string when a typed field would do.

use thiserror::Error;

/// Structured error type shared by the provider, risk, and agent crates.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum AgentError {
    #[error("tool validation failed: {message}")]
    ValidationError { message: String },

    #[error("tool call confirmation rejected by user")]
    ConfirmationRejected,

    #[error("tool execution failed: {message}")]
    ExecutionError { message: String },

    #[error("provider request failed after retries: {reason}")]
    ProviderFatal { reason: String },

    #[error("operation timed out: {details}")]
    Timeout { details: String },

    #[error("maximum session turns reached")]
    MaxTurnsReached,

    #[error("session aborted by user")]
    Aborted,

    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("duplicate tool registration: {name}")]
    DuplicateTool { name: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(e: anyhow::Error) -> Self {
        AgentError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_human_readable() {
        assert_eq!(
            AgentError::ConfirmationRejected.to_string(),
            "tool call confirmation rejected by user"
        );
        assert_eq!(
            AgentError::UnknownTool { name: "x".into() }.to_string(),
            "unknown tool: x"
        );
    }

    #[test]
    fn from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{ bad").unwrap_err();
        let agent_err: AgentError = err.into();
        assert!(matches!(agent_err, AgentError::Serialization(_)));
    }
}
