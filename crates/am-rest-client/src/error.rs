//! Error types for the event stream, the task session and configuration

use std::time::Duration;

use am_api_contract::{ResponseStatus, TaskId};
use am_client_api::ApiError;
use thiserror::Error;

/// Terminal errors delivered on a task's event sequence
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The connection stayed down for longer than the configured maximum.
    #[error("event stream unavailable for {downtime:?}")]
    Unavailable { downtime: Duration },

    /// The server refused the subscription for an authentication or
    /// validation reason. Never retried.
    #[error("subscription rejected ({status:?}): {message}")]
    Rejected {
        status: ResponseStatus,
        message: String,
    },

    #[error("task {0} is already subscribed on this stream")]
    AlreadySubscribed(TaskId),

    /// The subscription request could not be serialised for signing.
    #[error("cannot encode subscription: {0}")]
    Encode(String),

    #[error("event stream closed")]
    Closed,
}

impl StreamError {
    pub fn rejected(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }
}

/// Errors from client configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid value for {var}: {message}")]
    Env { var: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Errors surfaced by [`crate::TaskSession`]
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("credential error: {0}")]
    Credential(#[from] am_auth::AuthError),

    #[error("task {0} is not known to this session")]
    UnknownTask(TaskId),

    /// Each task's event sequence can be taken once per session.
    #[error("events for task {0} were already taken")]
    EventsAlreadyTaken(TaskId),
}

pub type SessionResult<T> = Result<T, SessionError>;
