//! Authentication error types.

/// Errors produced while loading credentials or verifying signed requests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Key material is malformed.
    #[error("credential invalid: {reason}")]
    CredentialInvalid { reason: String },

    /// The signature does not verify over the request.
    #[error("invalid signature")]
    InvalidSignature,

    /// The timestamp is older than the skew window allows.
    #[error("timestamp expired")]
    TimestampExpired,

    /// The timestamp is further in the future than the skew window allows.
    #[error("timestamp in future")]
    TimestampInFuture,

    /// The nonce was already used by this key inside the window.
    #[error("replay detected")]
    ReplayDetected,

    /// Encoded request fields could not be decoded.
    #[error("malformed request: {reason}")]
    Malformed { reason: String },
}

impl AuthError {
    pub(crate) fn credential(reason: impl Into<String>) -> Self {
        Self::CredentialInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Result alias for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;
