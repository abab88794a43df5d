//! Task session: submit tasks, follow their events, cancel them.
//!
//! The session keeps a local view of every task it submitted or resumed.
//! Events read through [`SessionEvents`] advance that view, and
//! [`TaskSession::status`] reconciles it with the server.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use am_api_contract::{Task, TaskId, TaskSpec};
use am_auth::{Credential, Signer};
use am_client_api::{StreamConnector, TaskApi};
use dashmap::DashMap;
use futures::Stream;
use tracing::{debug, info, warn};

use crate::client::RequestClient;
use crate::config::ClientConfig;
use crate::error::{SessionError, SessionResult, StreamError};
use crate::sse::SseConnector;
use crate::stream::{EventStream, StreamItem, StreamState, TaskEvents};

/// Reference to a task known to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    task_id: TaskId,
    idempotency_key: Option<String>,
    initial_cursor: u64,
}

impl TaskHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Cursor the task's event sequence starts after.
    pub fn initial_cursor(&self) -> u64 {
        self.initial_cursor
    }

    /// Key the task was submitted with; `None` for resumed tasks.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    /// Last event sequence handed to the caller.
    cursor: u64,
    events_taken: bool,
}

type TaskMap = Arc<DashMap<TaskId, TaskEntry>>;

struct SessionInner {
    api: Arc<dyn TaskApi>,
    stream: EventStream,
    tasks: TaskMap,
}

/// Facade over the request client and the event stream
#[derive(Clone)]
pub struct TaskSession {
    inner: Arc<SessionInner>,
}

impl TaskSession {
    pub fn new(
        api: Arc<dyn TaskApi>,
        connector: Arc<dyn StreamConnector>,
        signer: Signer,
        config: &ClientConfig,
    ) -> SessionResult<Self> {
        let stream = EventStream::spawn(connector, signer, config.stream.clone())?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                api,
                stream,
                tasks: TaskMap::default(),
            }),
        })
    }

    /// Session over HTTP and SSE. Must be called within a Tokio runtime.
    pub fn connect(config: &ClientConfig, credential: Credential) -> SessionResult<Self> {
        config.validate()?;
        let signer = Signer::new(credential);
        let client = RequestClient::over_http(config, signer.clone())?;
        let connector = SseConnector::new(config)?;
        Self::new(Arc::new(client), Arc::new(connector), signer, config)
    }

    /// Session configured from `AGENT_MARKET_*` and `AGENT_SECRET_KEY`.
    pub fn from_env() -> SessionResult<Self> {
        let config = ClientConfig::from_env()?;
        let credential = Credential::from_env()?;
        Self::connect(&config, credential)
    }

    /// Submit a task under a fresh idempotency key.
    pub async fn submit(&self, spec: impl Into<TaskSpec>) -> SessionResult<TaskHandle> {
        let key = uuid::Uuid::new_v4().to_string();
        self.submit_with_key(spec, key).await
    }

    /// Submit a task under a caller-chosen idempotency key. Submitting
    /// again with the same key yields a handle to the same task.
    pub async fn submit_with_key(
        &self,
        spec: impl Into<TaskSpec>,
        idempotency_key: impl Into<String>,
    ) -> SessionResult<TaskHandle> {
        let spec = spec.into();
        let idempotency_key = idempotency_key.into();
        let task = self.inner.api.submit_task(&spec, &idempotency_key).await?;
        let task_id = task.id.clone();

        let initial_cursor = self
            .inner
            .tasks
            .entry(task_id.clone())
            .and_modify(|entry| entry.task = task.clone())
            .or_insert_with(|| TaskEntry {
                task,
                cursor: 0,
                events_taken: false,
            })
            .cursor;
        info!(%task_id, "Session tracking submitted task");

        Ok(TaskHandle {
            task_id,
            idempotency_key: Some(idempotency_key),
            initial_cursor,
        })
    }

    /// Pick up a task submitted elsewhere; events resume after `cursor`.
    pub async fn resume(&self, task_id: TaskId, cursor: u64) -> SessionResult<TaskHandle> {
        let task = self.inner.api.get_task_status(&task_id).await?;
        self.inner.tasks.insert(
            task_id.clone(),
            TaskEntry {
                task,
                cursor,
                events_taken: false,
            },
        );
        debug!(%task_id, cursor, "Session resumed task");

        Ok(TaskHandle {
            task_id,
            idempotency_key: None,
            initial_cursor: cursor,
        })
    }

    /// The task's event sequence. Can be taken once per task.
    pub async fn events(&self, handle: &TaskHandle) -> SessionResult<SessionEvents> {
        let task_id = handle.task_id();
        let (cursor, finished) = {
            let mut entry = self
                .inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| SessionError::UnknownTask(task_id.clone()))?;
            if entry.events_taken {
                return Err(SessionError::EventsAlreadyTaken(task_id.clone()));
            }
            entry.events_taken = true;
            let finished = entry.task.state.is_terminal() && entry.cursor >= entry.task.cursor;
            (entry.cursor, finished)
        };

        let events = if finished {
            TaskEvents::ended(task_id.clone())
        } else {
            self.inner.stream.subscribe(task_id.clone(), cursor).await?
        };

        Ok(SessionEvents {
            events,
            tasks: self.inner.tasks.clone(),
        })
    }

    /// Cancel a task. Its event sequence ends.
    pub async fn cancel(&self, handle: &TaskHandle) -> SessionResult<Task> {
        let task_id = handle.task_id();
        self.ensure_known(task_id)?;

        let task = self.inner.api.cancel_task(task_id).await?;
        if let Some(mut entry) = self.inner.tasks.get_mut(task_id) {
            entry.task = task.clone();
        }

        match self.inner.stream.unsubscribe(task_id).await {
            Ok(()) | Err(StreamError::Closed) => {}
            Err(e) => warn!(%task_id, error = %e, "Failed to end event sequence"),
        }
        Ok(task)
    }

    /// Fetch the server view of a task and fold it into the local one.
    pub async fn status(&self, handle: &TaskHandle) -> SessionResult<Task> {
        let task_id = handle.task_id();
        self.ensure_known(task_id)?;

        let task = self.inner.api.get_task_status(task_id).await?;
        if let Some(mut entry) = self.inner.tasks.get_mut(task_id) {
            if entry.task.state != task.state {
                debug!(%task_id, local = %entry.task.state, server = %task.state, "Reconciled task state");
            }
            entry.task = task.clone();
        }
        Ok(task)
    }

    /// Local view of a task, without a network call.
    pub fn task(&self, handle: &TaskHandle) -> Option<Task> {
        self.inner
            .tasks
            .get(handle.task_id())
            .map(|entry| entry.task.clone())
    }

    /// Last event sequence delivered for a task.
    pub fn cursor(&self, handle: &TaskHandle) -> Option<u64> {
        self.inner
            .stream
            .cursor(handle.task_id())
            .or_else(|| self.inner.tasks.get(handle.task_id()).map(|e| e.cursor))
    }

    /// Follow the task's events until it finishes.
    ///
    /// Takes the task's event sequence. If the sequence ends without a
    /// terminal event the server is asked for the final state.
    pub async fn wait_for_completion(&self, handle: &TaskHandle) -> SessionResult<Task> {
        let mut events = self.events(handle).await?;
        while let Some(item) = events.next_event().await {
            match item {
                Ok(StreamItem::Event(_)) => {}
                Ok(StreamItem::Gap(gap)) => {
                    debug!(task_id = %gap.task_id, expected = gap.expected, observed = gap.observed, "Gap while waiting");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.task(handle) {
            Some(task) if task.state.is_terminal() => Ok(task),
            _ => self.status(handle).await,
        }
    }

    pub fn stream_state(&self) -> StreamState {
        self.inner.stream.state()
    }

    /// Close the event stream. Request/response calls keep working.
    pub async fn close(&self) {
        self.inner.stream.close().await;
    }

    fn ensure_known(&self, task_id: &TaskId) -> SessionResult<()> {
        if self.inner.tasks.contains_key(task_id) {
            Ok(())
        } else {
            Err(SessionError::UnknownTask(task_id.clone()))
        }
    }
}

impl std::fmt::Debug for TaskSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSession")
            .field("tasks", &self.inner.tasks.len())
            .field("stream", &self.inner.stream)
            .finish()
    }
}

/// A task's event sequence that keeps the session's local view current
pub struct SessionEvents {
    events: TaskEvents,
    tasks: TaskMap,
}

impl SessionEvents {
    pub fn task_id(&self) -> &TaskId {
        self.events.task_id()
    }

    pub async fn next_event(&mut self) -> Option<Result<StreamItem, StreamError>> {
        let item = self.events.next_event().await;
        self.observe(item.as_ref());
        item
    }

    fn observe(&self, item: Option<&Result<StreamItem, StreamError>>) {
        let Some(Ok(StreamItem::Event(event))) = item else {
            return;
        };
        if let Some(mut entry) = self.tasks.get_mut(&event.task_id) {
            entry.cursor = entry.cursor.max(event.sequence);
            entry.task.cursor = entry.task.cursor.max(event.sequence);
            if let Some(state) = event.new_state() {
                entry.task.state = state;
            }
        }
    }
}

impl Stream for SessionEvents {
    type Item = Result<StreamItem, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = std::task::ready!(Pin::new(&mut this.events).poll_next(cx));
        this.observe(item.as_ref());
        Poll::Ready(item)
    }
}

impl std::fmt::Debug for SessionEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEvents")
            .field("task_id", self.task_id())
            .finish()
    }
}
