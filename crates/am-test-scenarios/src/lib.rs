//! Scenario model and loader for event stream tests
//!
//! A scenario scripts what the server side of each successive stream
//! connection does. Scenarios can be written in Rust or loaded from JSON:
//!
//! ```json
//! {
//!   "name": "gap",
//!   "connections": [
//!     { "type": "steps", "steps": [
//!       { "type": "ack" },
//!       { "type": "frame", "frame": { "type": "heartbeat", "timestamp": "2024-01-01T00:00:00Z" } },
//!       { "type": "drop" }
//!     ] },
//!     { "type": "refuse" }
//!   ]
//! }
//! ```

use am_api_contract::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Step {
    /// Acknowledge the oldest subscribe frame not yet acknowledged,
    /// accepting every task it names.
    Ack,
    /// Push a frame to the client.
    Frame { frame: ServerFrame },
    /// Reject the connection.
    Reject {
        status: ResponseStatus,
        message: String,
    },
    /// Fail the connection with a transport error.
    Drop,
    /// Close the connection cleanly.
    Close,
    /// Send nothing more on this connection.
    Silence,
}

impl Step {
    pub fn event(event: Event) -> Self {
        Self::Frame {
            frame: ServerFrame::Event(event),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Frame {
            frame: ServerFrame::heartbeat(),
        }
    }

    pub fn reject(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self::Reject {
            status,
            message: message.into(),
        }
    }
}

/// What the server does on one connection attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionScript {
    /// The connect attempt itself fails.
    Refuse,
    Steps { steps: Vec<Step> },
}

impl ConnectionScript {
    pub fn steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self::Steps {
            steps: steps.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// One script per connection attempt, in order.
    pub connections: Vec<ConnectionScript>,
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connections: Vec::new(),
        }
    }

    pub fn connection(mut self, script: ConnectionScript) -> Self {
        self.connections.push(script);
        self
    }

    pub fn from_str(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
