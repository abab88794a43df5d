//! Resumable, multiplexed task event stream
//!
//! A single background driver owns the stream connection. It subscribes
//! every active task with its resume cursor, reconnects with backoff when
//! the connection is lost or goes silent, drops replayed duplicates and
//! resynchronises once when it sees a hole in a task's sequence numbers.
//! Each subscribed task gets its own bounded [`TaskEvents`] sequence and
//! the driver never waits on a consumer. Events for a slow consumer queue
//! up behind its channel; once that backlog passes the configured buffer
//! the task stops taking new events and, when the consumer catches up,
//! resubscribes to have them replayed from its cursor.

mod cursor;
mod driver;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use am_api_contract::{Event, TaskId};
use am_auth::Signer;
use am_client_api::StreamConnector;
use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::StreamConfig;
use crate::error::{ConfigError, StreamError};

use driver::Driver;

/// Connection lifecycle of the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No active subscriptions; no connection is held.
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting { attempt: u32 },
    /// `close` was requested; buffered events are being handed out.
    Draining,
    Closed,
}

impl StreamState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A hole in a task's sequence numbers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGap {
    pub task_id: TaskId,
    pub expected: u64,
    pub observed: u64,
}

/// An item on a task's event sequence
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(Event),
    /// Reported once per hole, before the stream resubscribes to fill it.
    Gap(SequenceGap),
}

/// Last delivered sequence number per subscribed task
pub type CursorSnapshot = Arc<BTreeMap<TaskId, u64>>;

type ItemSender = mpsc::Sender<Result<StreamItem, StreamError>>;

enum Command {
    Subscribe {
        task_id: TaskId,
        from_cursor: u64,
        reply: oneshot::Sender<Result<TaskEvents, StreamError>>,
    },
    Unsubscribe {
        task_id: TaskId,
    },
    Close,
}

/// Handle to the background event stream driver
///
/// Dropping the last handle closes the stream the same way [`Self::close`]
/// does, without waiting for it.
pub struct EventStream {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<StreamState>,
    cursors: watch::Receiver<CursorSnapshot>,
}

impl EventStream {
    /// Start the driver task. Must be called within a Tokio runtime.
    pub fn spawn(
        connector: Arc<dyn StreamConnector>,
        signer: Signer,
        config: StreamConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (commands, command_rx) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(StreamState::Disconnected);
        let (cursor_tx, cursors) = watch::channel(CursorSnapshot::default());

        let driver = Driver::new(connector, signer, config, command_rx, state_tx, cursor_tx);
        tokio::spawn(driver.run());

        Ok(Self {
            commands,
            state,
            cursors,
        })
    }

    /// Subscribe to one task, resuming after `from_cursor` (`0` for the
    /// full history).
    pub async fn subscribe(
        &self,
        task_id: TaskId,
        from_cursor: u64,
    ) -> Result<TaskEvents, StreamError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                task_id,
                from_cursor,
                reply,
            })
            .await
            .map_err(|_| StreamError::Closed)?;
        response.await.map_err(|_| StreamError::Closed)?
    }

    /// Subscribe to several tasks at once.
    pub async fn open(
        &self,
        subscriptions: impl IntoIterator<Item = (TaskId, u64)>,
    ) -> Result<Vec<TaskEvents>, StreamError> {
        let mut streams = Vec::new();
        for (task_id, cursor) in subscriptions {
            streams.push(self.subscribe(task_id, cursor).await?);
        }
        Ok(streams)
    }

    /// Stop delivering events for a task and end its sequence.
    pub async fn unsubscribe(&self, task_id: &TaskId) -> Result<(), StreamError> {
        self.commands
            .send(Command::Unsubscribe {
                task_id: task_id.clone(),
            })
            .await
            .map_err(|_| StreamError::Closed)
    }

    /// Close the stream and wait until it reaches [`StreamState::Closed`].
    ///
    /// Consumers get up to the configured drain timeout to read events that
    /// were already buffered. Closing twice is a no-op.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_closed()).await;
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn cursors(&self) -> CursorSnapshot {
        self.cursors.borrow().clone()
    }

    pub fn cursor(&self, task_id: &TaskId) -> Option<u64> {
        self.cursors.borrow().get(task_id).copied()
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("state", &self.state())
            .field("cursors", &self.cursors())
            .finish()
    }
}

/// Ordered, deduplicated event sequence for one task
///
/// Ends after the task's terminal event, after an unsubscribe, or after a
/// terminal [`StreamError`].
pub struct TaskEvents {
    task_id: TaskId,
    items: mpsc::Receiver<Result<StreamItem, StreamError>>,
    drained: Option<oneshot::Sender<()>>,
}

impl TaskEvents {
    fn new(
        task_id: TaskId,
        items: mpsc::Receiver<Result<StreamItem, StreamError>>,
        drained: oneshot::Sender<()>,
    ) -> Self {
        Self {
            task_id,
            items,
            drained: Some(drained),
        }
    }

    /// A sequence that is already over.
    pub fn ended(task_id: TaskId) -> Self {
        let (_, items) = mpsc::channel(1);
        Self {
            task_id,
            items,
            drained: None,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub async fn next_event(&mut self) -> Option<Result<StreamItem, StreamError>> {
        let item = self.items.recv().await;
        self.observe(item.as_ref());
        item
    }

    /// Release the drain wait once nothing more will be read.
    fn observe(&mut self, item: Option<&Result<StreamItem, StreamError>>) {
        let finished = match item {
            None | Some(Err(_)) => true,
            Some(Ok(StreamItem::Event(event))) => event.is_terminal(),
            Some(Ok(StreamItem::Gap(_))) => false,
        };
        if finished {
            self.drained.take();
        }
    }
}

impl Stream for TaskEvents {
    type Item = Result<StreamItem, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = std::task::ready!(this.items.poll_recv(cx));
        this.observe(item.as_ref());
        Poll::Ready(item)
    }
}

impl std::fmt::Debug for TaskEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEvents")
            .field("task_id", &self.task_id)
            .finish()
    }
}
