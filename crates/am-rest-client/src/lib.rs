//! Client for the agent-market task service
//!
//! - [`RequestClient`]: signed request/response calls with retry, backoff
//!   and per-attempt timeouts.
//! - [`EventStream`]: one resumable connection multiplexing the event
//!   sequences of many tasks.
//! - [`TaskSession`]: the facade most callers want, combining both.
//!
//! HTTP and SSE transports are provided; anything implementing the
//! `am-client-api` transport traits can be plugged in instead.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod sse;
pub mod stream;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{RequestClient, Response};
pub use config::{ClientConfig, RetryPolicy, StreamConfig};
pub use error::{ConfigError, SessionError, SessionResult, StreamError};
pub use http::HttpTransport;
pub use session::{SessionEvents, TaskHandle, TaskSession};
pub use sse::{SseConnector, SseTransport};
pub use stream::{CursorSnapshot, EventStream, SequenceGap, StreamItem, StreamState, TaskEvents};

pub use am_client_api::{ApiError, ApiResult, TaskApi, TransportError};

use am_api_contract::{Task, TaskId, TaskSpec};
use async_trait::async_trait;

#[async_trait]
impl TaskApi for RequestClient {
    async fn submit_task(&self, spec: &TaskSpec, idempotency_key: &str) -> ApiResult<Task> {
        RequestClient::submit_task(self, spec, idempotency_key).await
    }

    async fn get_task_status(&self, task_id: &TaskId) -> ApiResult<Task> {
        RequestClient::get_task_status(self, task_id).await
    }

    async fn cancel_task(&self, task_id: &TaskId) -> ApiResult<Task> {
        RequestClient::cancel_task(self, task_id).await
    }
}
