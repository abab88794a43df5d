//! Transport collaborator interfaces

use std::time::Duration;

use am_api_contract::{ClientFrame, Operation, RequestAuth, ResponseStatus, ServerFrame};
use async_trait::async_trait;

use crate::error::TransportResult;

/// A signed request as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub operation: Operation,
    pub payload: Vec<u8>,
    pub auth: RequestAuth,
}

/// A response as read back from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: ResponseStatus,
    /// Server hint for how long to wait before retrying.
    pub retry_after: Option<Duration>,
    /// JSON [`am_api_contract::ApiEnvelope`] body.
    pub body: Vec<u8>,
}

/// Stateless request/response exchange.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// Perform one network exchange. Implementations do not retry.
    async fn call(&self, request: ApiRequest) -> TransportResult<RawResponse>;
}

/// One bidirectional frame connection to the event feed.
#[async_trait]
pub trait StreamTransport: Send {
    async fn send(&mut self, frame: ClientFrame) -> TransportResult<()>;

    /// Wait for the next frame. `Ok(None)` means the remote closed the
    /// connection cleanly.
    async fn receive(&mut self) -> TransportResult<Option<ServerFrame>>;

    async fn close(&mut self) -> TransportResult<()>;
}

/// Factory for stream connections; called once per (re)connect attempt.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> TransportResult<Box<dyn StreamTransport>>;
}
