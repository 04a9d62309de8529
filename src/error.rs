//! Error types for the deposit rate assistant

use crate::workflow::TransitionError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Error, Debug)]
pub enum AssistantError {

    // =============================
    // Startup
    // =============================

    #[error("Missing required configuration: {0}")]
    ConfigurationMissing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // =============================
    // Rate resolution
    // =============================

    #[error("Invalid rate band: {0}")]
    InvalidRateBand(String),

    #[error("No deposit rate available for {amount} euros over {duration} days")]
    RateNotFound { amount: u64, duration: u32 },

    // =============================
    // External capabilities
    // =============================

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("LLM call timed out after {0:?}")]
    LlmTimeout(Duration),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool loop exceeded {0} rounds in a single turn")]
    ToolLoopExceeded(u32),

    // =============================
    // Session lifecycle
    // =============================

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Session {0} is closed")]
    SessionClosed(Uuid),

    #[error("Session {0} is waiting for a confirmation response")]
    AwaitingConfirmation(Uuid),

    #[error("Session {0} has no pending confirmation")]
    NotAwaitingConfirmation(Uuid),

    #[error("Confirmation request for session {0} expired")]
    ConfirmationExpired(Uuid),

    #[error("Confirmation request mismatch: expected {expected}, got {received}")]
    RequestMismatch { expected: Uuid, received: Uuid },

    #[error("Invalid resume payload: {0}")]
    InvalidResume(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("State persistence error: {0}")]
    StateError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AssistantError {
    /// Transient failures of the language model or a tool. The turn can be
    /// retried and the persisted session is unchanged.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AssistantError::LlmError(_)
                | AssistantError::LlmTimeout(_)
                | AssistantError::ToolError(_)
                | AssistantError::HttpError(_)
        )
    }

    /// Text that is safe to show to the client.
    pub fn user_message(&self) -> String {
        match self {
            e if e.is_recoverable() => {
                "Sorry, the assistant is temporarily unavailable. Please send your message again."
                    .to_string()
            }
            AssistantError::RateNotFound { amount, duration } => format!(
                "Unfortunately no deposit rate is available for {} euros over {} days.",
                amount, duration
            ),
            AssistantError::SessionNotFound(_) => "This conversation does not exist.".to_string(),
            AssistantError::SessionClosed(_) => {
                "This conversation has ended. Please start a new one.".to_string()
            }
            AssistantError::AwaitingConfirmation(_) => {
                "Please confirm or correct the deposit amount and duration first.".to_string()
            }
            AssistantError::NotAwaitingConfirmation(_) | AssistantError::RequestMismatch { .. } => {
                "There is no pending confirmation for this request.".to_string()
            }
            AssistantError::ConfirmationExpired(_) => {
                "The confirmation request expired. Please start a new conversation.".to_string()
            }
            AssistantError::ToolLoopExceeded(_) => {
                "The assistant could not answer this message. Please rephrase it.".to_string()
            }
            AssistantError::InvalidResume(detail) => {
                format!("The correction could not be applied: {}", detail)
            }
            _ => "An unexpected internal error occurred.".to_string(),
        }
    }
}
