//! Error types for API contract validation and parsing

use thiserror::Error;

use crate::types::Operation;

/// Errors that can occur during API contract validation and parsing
#[derive(Debug, Error)]
pub enum ApiContractError {
    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid task state: {0}")]
    InvalidTaskState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Empty payload for mutating operation {0}")]
    EmptyPayload(Operation),

    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),
}

/// Error body carried inside a failed [`crate::ApiEnvelope`]
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}
