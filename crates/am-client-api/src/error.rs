//! Error taxonomy shared by request clients and transports

use std::time::Duration;

use am_api_contract::{ApiContractError, ResponseStatus};
use thiserror::Error;

/// Failures reported by a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection lost: {0}")]
    Lost(String),

    #[error("transport timed out")]
    Timeout,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether another attempt over a fresh connection may succeed.
    /// Protocol violations and a closed transport fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Lost(_) | Self::Timeout)
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by request/response calls
#[derive(Debug, Error)]
pub enum ApiError {
    /// Key material is unusable. Never retried.
    #[error("credential invalid: {0}")]
    CredentialInvalid(String),

    /// The server refused the credentials. Never retried; the caller must
    /// re-derive credentials.
    #[error("authentication failed ({code}): {message}")]
    Auth { code: String, message: String },

    /// The request itself is defective. Never retried.
    #[error("validation failed ({code}): {message}")]
    Validation { code: String, message: String },

    /// The server kept answering with a retryable status until the retry
    /// budget ran out.
    #[error("retryable error after {attempts} attempt(s) ({code}): {message}")]
    Retryable {
        code: String,
        message: String,
        attempts: u32,
    },

    /// No response within the per-attempt timeout. The remote effect is
    /// unknown.
    #[error("request timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ApiError {
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the retry policy may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Retryable { .. } | Self::Timeout { .. } => true,
            Self::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Classification of this error in terms of response status.
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            Self::Auth { .. } | Self::CredentialInvalid(_) => Some(ResponseStatus::Auth),
            Self::Validation { .. } => Some(ResponseStatus::Validation),
            Self::Transport(e) if !e.is_retryable() => Some(ResponseStatus::Validation),
            Self::Retryable { .. } | Self::Timeout { .. } | Self::Transport(_) => {
                Some(ResponseStatus::Retryable)
            }
            Self::UnexpectedResponse(_) => None,
        }
    }
}

impl From<ApiContractError> for ApiError {
    fn from(e: ApiContractError) -> Self {
        Self::validation("invalid_request", e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ApiError::Transport(TransportError::Timeout).is_retryable());
        assert!(ApiError::Timeout {
            duration: Duration::from_secs(1)
        }
        .is_retryable());
        assert!(!ApiError::auth("unauthorized", "bad key").is_retryable());
        assert!(!ApiError::validation("invalid", "bad spec").is_retryable());
    }

    #[test]
    fn test_protocol_violation_is_not_retried() {
        let protocol = ApiError::Transport(TransportError::Protocol("bad header".into()));
        assert!(!protocol.is_retryable());
        assert_eq!(protocol.status(), Some(ResponseStatus::Validation));
        assert!(!ApiError::Transport(TransportError::Closed).is_retryable());

        for e in [
            TransportError::Connect("refused".into()),
            TransportError::Lost("reset".into()),
            TransportError::Timeout,
        ] {
            assert!(ApiError::Transport(e).is_retryable());
        }
    }

    #[test]
    fn test_contract_error_maps_to_validation() {
        let err: ApiError =
            ApiContractError::EmptyPayload(am_api_contract::Operation::SubmitTask).into();
        assert_eq!(err.status(), Some(ResponseStatus::Validation));
    }
}
