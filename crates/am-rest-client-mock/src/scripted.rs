//! Stream connector that plays back a [`Scenario`]

use std::collections::VecDeque;
use std::sync::Arc;

use am_api_contract::*;
use am_client_api::{StreamConnector, StreamTransport, TransportError, TransportResult};
use am_test_scenarios::{ConnectionScript, Scenario, Step};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct Recorded {
    scripts: VecDeque<ConnectionScript>,
    subscriptions: Vec<SubscribeFrame>,
    attempted_at: Vec<Instant>,
}

/// Hands out one scripted connection per connect attempt and records the
/// subscribe frames the client sends.
#[derive(Clone)]
pub struct ScriptedConnector {
    name: String,
    recorded: Arc<Mutex<Recorded>>,
}

impl ScriptedConnector {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            name: scenario.name,
            recorded: Arc::new(Mutex::new(Recorded {
                scripts: scenario.connections.into(),
                ..Recorded::default()
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe frames received so far, across all connections.
    pub async fn subscriptions(&self) -> Vec<SubscribeFrame> {
        self.recorded.lock().await.subscriptions.clone()
    }

    /// Connect attempts so far, including refused ones.
    pub async fn attempts(&self) -> usize {
        self.recorded.lock().await.attempted_at.len()
    }

    /// When each connect attempt was made.
    pub async fn attempted_at(&self) -> Vec<Instant> {
        self.recorded.lock().await.attempted_at.clone()
    }
}

#[async_trait]
impl StreamConnector for ScriptedConnector {
    async fn connect(&self) -> TransportResult<Box<dyn StreamTransport>> {
        let mut recorded = self.recorded.lock().await;
        recorded.attempted_at.push(Instant::now());
        match recorded.scripts.pop_front() {
            None => Err(TransportError::Connect(format!(
                "scenario {} has no connections left",
                self.name
            ))),
            Some(ConnectionScript::Refuse) => {
                Err(TransportError::Connect("refused by scenario".to_string()))
            }
            Some(ConnectionScript::Steps { steps }) => Ok(Box::new(ScriptedTransport {
                steps: steps.into(),
                unacked: VecDeque::new(),
                recorded: self.recorded.clone(),
            })),
        }
    }
}

struct ScriptedTransport {
    steps: VecDeque<Step>,
    unacked: VecDeque<SubscribeRequest>,
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn send(&mut self, frame: ClientFrame) -> TransportResult<()> {
        let ClientFrame::Subscribe(subscribe) = frame;
        self.unacked.push_back(subscribe.request.clone());
        self.recorded.lock().await.subscriptions.push(subscribe);
        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Option<ServerFrame>> {
        match self.steps.pop_front() {
            None | Some(Step::Silence) => std::future::pending().await,
            Some(Step::Ack) => match self.unacked.pop_front() {
                Some(request) => Ok(Some(ServerFrame::Subscribed(SubscribeAck {
                    accepted: request.task_ids,
                    starting_cursors: request.resume_cursors,
                }))),
                None => {
                    // Wait for the client to subscribe; a later call retries.
                    self.steps.push_front(Step::Ack);
                    std::future::pending().await
                }
            },
            Some(Step::Frame { frame }) => Ok(Some(frame)),
            Some(Step::Reject { status, message }) => Ok(Some(ServerFrame::Rejected(Rejection {
                status,
                message,
                task_ids: Vec::new(),
            }))),
            Some(Step::Drop) => Err(TransportError::Lost("dropped by scenario".to_string())),
            Some(Step::Close) => Ok(None),
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.steps.clear();
        Ok(())
    }
}
