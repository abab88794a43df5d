//! Server-Sent Events transport for the event stream
//!
//! Each subscription handshake is a signed `POST events/subscribe` whose
//! response body is an SSE stream of JSON-encoded [`ServerFrame`]s. SSE
//! comments count as heartbeats. Reconnection is left to the event stream
//! driver, so the SSE client never reconnects on its own.

use std::collections::VecDeque;

use am_api_contract::{ApiEnvelope, ClientFrame, Rejection, ResponseStatus, ServerFrame};
use am_client_api::{StreamConnector, StreamTransport, TransportError, TransportResult};
use async_trait::async_trait;
use eventsource_client as es;
use es::Client as _;
use futures::StreamExt;
use tracing::{debug, trace};
use url::Url;

use crate::config::{endpoint, ClientConfig};
use crate::error::ConfigError;

pub const SUBSCRIBE_PATH: &str = "events/subscribe";

/// Event type the server may use for explicit keep-alives.
const HEARTBEAT_EVENT: &str = "heartbeat";

type SseStream = es::BoxStream<es::Result<es::SSE>>;

/// Opens SSE subscriptions against the marketplace
#[derive(Debug, Clone)]
pub struct SseConnector {
    url: Url,
    user_agent: String,
}

impl SseConnector {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let url = endpoint(&config.base_url, SUBSCRIBE_PATH)?;
        Ok(Self {
            url,
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn connect(&self) -> TransportResult<Box<dyn StreamTransport>> {
        Ok(Box::new(SseTransport {
            url: self.url.clone(),
            user_agent: self.user_agent.clone(),
            events: None,
            pending: VecDeque::new(),
        }))
    }
}

/// One SSE connection. Each `send` replaces the response being read.
pub struct SseTransport {
    url: Url,
    user_agent: String,
    events: Option<SseStream>,
    pending: VecDeque<ServerFrame>,
}

impl SseTransport {
    fn open(&self, body: String) -> es::Result<SseStream> {
        let client = es::ClientBuilder::for_url(self.url.as_str())?
            .method("POST".to_string())
            .body(body)
            .header("content-type", "application/json")?
            .header("accept", "text/event-stream")?
            .header("cache-control", "no-cache")?
            .header("user-agent", &self.user_agent)?
            .reconnect(es::ReconnectOptions::reconnect(false).retry_initial(false).build())
            .build();
        Ok(client.stream())
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn send(&mut self, frame: ClientFrame) -> TransportResult<()> {
        let ClientFrame::Subscribe(subscribe) = &frame;
        let body = serde_json::to_string(&frame)
            .map_err(|e| TransportError::Protocol(format!("cannot encode frame: {e}")))?;

        self.events = None;
        let mut events = self.open(body).map_err(map_open_error)?;

        match events.next().await {
            Some(Ok(es::SSE::Connected(_))) => {
                debug!(tasks = subscribe.request.task_ids.len(), "SSE subscription opened");
                self.events = Some(events);
                Ok(())
            }
            Some(Ok(sse)) => {
                // Items before the connection notice are not expected; keep them.
                if let Some(frame) = decode(sse)? {
                    self.pending.push_back(frame);
                }
                self.events = Some(events);
                Ok(())
            }
            Some(Err(es::Error::UnexpectedResponse(response, body))) => {
                let status = ResponseStatus::from_http(response.status());
                let message = match body.body_bytes().await {
                    Ok(bytes) => rejection_message(&bytes),
                    Err(e) => e.to_string(),
                };
                debug!(?status, %message, "Subscription refused over HTTP");
                self.pending.push_back(ServerFrame::Rejected(Rejection {
                    status,
                    message,
                    task_ids: Vec::new(),
                }));
                Ok(())
            }
            Some(Err(e)) => Err(map_stream_error(e)),
            None => Err(TransportError::Lost("no response to subscription".to_string())),
        }
    }

    async fn receive(&mut self) -> TransportResult<Option<ServerFrame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }

            let Some(events) = self.events.as_mut() else {
                return Err(TransportError::Protocol(
                    "receive called before subscribing".to_string(),
                ));
            };
            match events.next().await {
                Some(Ok(sse)) => {
                    if let Some(frame) = decode(sse)? {
                        return Ok(Some(frame));
                    }
                }
                Some(Err(es::Error::Eof)) | None => {
                    self.events = None;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.events = None;
                    return Err(map_stream_error(e));
                }
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.events = None;
        Ok(())
    }
}

/// Map one SSE item onto a server frame. `None` means nothing to deliver.
fn decode(sse: es::SSE) -> TransportResult<Option<ServerFrame>> {
    match sse {
        es::SSE::Connected(_) => Ok(None),
        es::SSE::Comment(comment) => {
            trace!(%comment, "SSE comment");
            Ok(Some(ServerFrame::heartbeat()))
        }
        es::SSE::Event(event) => decode_event(event),
    }
}

fn decode_event(event: es::Event) -> TransportResult<Option<ServerFrame>> {
    if event.event_type == HEARTBEAT_EVENT {
        return Ok(Some(ServerFrame::heartbeat()));
    }
    if event.data.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&event.data)
        .map(Some)
        .map_err(|e| TransportError::Protocol(format!("undecodable frame: {e}")))
}

fn rejection_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ApiEnvelope<serde_json::Value>>(body) {
        Ok(ApiEnvelope {
            error: Some(error), ..
        }) => error.message,
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

fn map_open_error(e: es::Error) -> TransportError {
    TransportError::Protocol(format!("cannot build subscription request: {e}"))
}

fn map_stream_error(e: es::Error) -> TransportError {
    match e {
        es::Error::TimedOut => TransportError::Timeout,
        es::Error::InvalidLine(_) | es::Error::InvalidEvent => {
            TransportError::Protocol(e.to_string())
        }
        es::Error::StreamClosed => TransportError::Closed,
        other => TransportError::Lost(other.to_string()),
    }
}
