//! Background task that owns the stream connection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use am_api_contract::validation::validate_task_id;
use am_api_contract::{
    ClientFrame, Event, Rejection, ResponseStatus, ServerFrame, SubscribeAck, SubscribeFrame,
    SubscribeRequest, TaskId,
};
use am_auth::Signer;
use am_client_api::{StreamConnector, StreamTransport, TransportError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::cursor::{Delivery, TaskCursor};
use super::{
    Command, CursorSnapshot, ItemSender, SequenceGap, StreamItem, StreamState, TaskEvents,
};
use crate::auth::request_auth;
use crate::backoff::Backoff;
use crate::config::StreamConfig;
use crate::error::StreamError;

/// Items waiting for room in one consumer's channel.
struct Outbox {
    items: ItemSender,
    pending: VecDeque<Result<StreamItem, StreamError>>,
}

enum Flush {
    Done,
    Blocked,
    /// The consumer dropped its receiver.
    Gone,
}

impl Outbox {
    fn new(items: ItemSender) -> Self {
        Self {
            items,
            pending: VecDeque::new(),
        }
    }

    fn push(&mut self, item: Result<StreamItem, StreamError>) {
        self.pending.push_back(item);
    }

    fn backlog(&self) -> usize {
        self.pending.len()
    }

    fn is_blocked(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Move as many pending items into the channel as fit, without waiting.
    fn flush(&mut self) -> Flush {
        if self.items.is_closed() {
            self.pending.clear();
            return Flush::Gone;
        }
        while let Some(item) = self.pending.pop_front() {
            match self.items.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.pending.push_front(item);
                    return Flush::Blocked;
                }
                Err(TrySendError::Closed(_)) => {
                    self.pending.clear();
                    return Flush::Gone;
                }
            }
        }
        Flush::Done
    }

    /// Hand over everything left, waiting for the consumer as needed.
    async fn drain(self) {
        let Outbox { items, pending } = self;
        for item in pending {
            if items.send(item).await.is_err() {
                return;
            }
        }
    }
}

struct TaskSlot {
    cursor: TaskCursor,
    outbox: Outbox,
    drained: oneshot::Receiver<()>,
    /// The backlog overflowed; new events are dropped until the consumer
    /// catches up and they are replayed from the cursor.
    lagging: bool,
}

/// A task whose sequence ended, kept until its consumer has read it.
struct Ended {
    outbox: Option<Outbox>,
    drained: oneshot::Receiver<()>,
}

/// Why a connection attempt or a live connection ended.
enum Exit {
    /// `close` was called or every handle was dropped.
    Close,
    /// No subscriptions are left.
    Idle,
    /// Reconnect after backoff.
    Retry(String),
    /// Every task ends with this error.
    Fatal(StreamError),
}

enum HandshakeError {
    Transport(TransportError),
    Rejected(Rejection),
    Timeout,
}

type Established = (Box<dyn StreamTransport>, SubscribeAck, Vec<ServerFrame>);

pub(super) struct Driver {
    connector: Arc<dyn StreamConnector>,
    signer: Signer,
    config: StreamConfig,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<StreamState>,
    cursors: watch::Sender<CursorSnapshot>,
    tasks: BTreeMap<TaskId, TaskSlot>,
    ended: Vec<Ended>,
    backoff: Backoff,
    /// The active task set changed since the last subscribe frame.
    resubscribe: bool,
}

impl Driver {
    pub(super) fn new(
        connector: Arc<dyn StreamConnector>,
        signer: Signer,
        config: StreamConfig,
        commands: mpsc::Receiver<Command>,
        state: watch::Sender<StreamState>,
        cursors: watch::Sender<CursorSnapshot>,
    ) -> Self {
        let backoff = Backoff::new(config.reconnect);
        Self {
            connector,
            signer,
            config,
            commands,
            state,
            cursors,
            tasks: BTreeMap::new(),
            ended: Vec::new(),
            backoff,
            resubscribe: false,
        }
    }

    pub(super) async fn run(mut self) {
        let mut outage: Option<Instant> = None;

        loop {
            if self.tasks.is_empty() {
                outage = None;
                self.backoff.reset();
                self.set_state(StreamState::Disconnected);
                match self.next_command().await {
                    None | Some(Command::Close) => break,
                    Some(command) => {
                        self.handle(command);
                        continue;
                    }
                }
            }

            let attempt_started = Instant::now();
            let exit = match self.establish().await {
                Ok((transport, early)) => {
                    outage = None;
                    self.set_state(StreamState::Subscribed);
                    info!(tasks = self.tasks.len(), "Event stream subscribed");

                    let connected_at = Instant::now();
                    let exit = self.pump(transport, early).await;
                    if connected_at.elapsed() >= self.config.stability_threshold {
                        self.backoff.reset();
                    }
                    if matches!(exit, Exit::Retry(_)) {
                        outage = Some(Instant::now());
                    }
                    exit
                }
                Err(exit) => {
                    if matches!(exit, Exit::Retry(_)) {
                        outage.get_or_insert(attempt_started);
                    }
                    exit
                }
            };

            let reason = match exit {
                Exit::Close => break,
                Exit::Idle => continue,
                Exit::Fatal(err) => {
                    error!(error = %err, "Event stream failed");
                    self.fail_all(err);
                    continue;
                }
                Exit::Retry(reason) => reason,
            };
            let outage_start = outage.unwrap_or(attempt_started);

            let Some(delay) = self.next_delay(outage_start) else {
                self.give_up(outage_start);
                outage = None;
                continue;
            };
            let attempt = self.backoff.attempt();
            warn!(
                %reason,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Event stream disconnected, reconnecting"
            );
            self.set_state(StreamState::Reconnecting { attempt });

            match self.pause(delay).await {
                Some(Exit::Close) => break,
                Some(_) => continue,
                None => {}
            }
            if self.watchdog_expired(outage_start) {
                self.give_up(outage_start);
                outage = None;
            }
        }

        self.shutdown().await;
    }

    /// Connect and subscribe the full active task set.
    async fn establish(&mut self) -> Result<(Box<dyn StreamTransport>, Vec<ServerFrame>), Exit> {
        self.set_state(StreamState::Connecting);
        self.resubscribe = false;
        let frame = match self.subscribe_frame() {
            Ok(frame) => frame,
            Err(err) => return Err(Exit::Fatal(err)),
        };
        let handshake = handshake(
            self.connector.clone(),
            frame,
            self.config.handshake_timeout,
        );
        tokio::pin!(handshake);

        loop {
            let blocked = self.blocked();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return Err(Exit::Close),
                    Some(command) => {
                        self.handle(command);
                        if self.tasks.is_empty() {
                            return Err(Exit::Idle);
                        }
                    }
                },
                _ = room(blocked) => self.flush_all(),
                result = &mut handshake => {
                    return match result {
                        Ok((transport, ack, early)) => {
                            self.apply_ack(&ack);
                            Ok((transport, early))
                        }
                        Err(HandshakeError::Rejected(rejection)) => Err(rejection_exit(rejection)),
                        Err(HandshakeError::Transport(e)) => Err(Exit::Retry(e.to_string())),
                        Err(HandshakeError::Timeout) => {
                            Err(Exit::Retry("subscription handshake timed out".to_string()))
                        }
                    };
                }
            }
        }
    }

    /// Read frames until the connection ends.
    async fn pump(
        &mut self,
        mut transport: Box<dyn StreamTransport>,
        early: Vec<ServerFrame>,
    ) -> Exit {
        for frame in early {
            if let Some(exit) = self.on_frame(frame) {
                let _ = transport.close().await;
                return exit;
            }
        }

        let heartbeat_timeout = self.config.heartbeat_timeout;
        let mut deadline = Instant::now() + heartbeat_timeout;
        loop {
            if self.tasks.is_empty() {
                let _ = transport.close().await;
                return Exit::Idle;
            }
            if self.resubscribe {
                self.resubscribe = false;
                let frame = match self.subscribe_frame() {
                    Ok(frame) => frame,
                    Err(err) => {
                        let _ = transport.close().await;
                        return Exit::Fatal(err);
                    }
                };
                debug!(tasks = self.tasks.len(), "Resubscribing");
                if let Err(e) = transport.send(frame).await {
                    return Exit::Retry(e.to_string());
                }
            }

            let blocked = self.blocked();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => {
                        let _ = transport.close().await;
                        return Exit::Close;
                    }
                    Some(command) => self.handle(command),
                },
                _ = room(blocked) => self.flush_all(),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        timeout_ms = heartbeat_timeout.as_millis() as u64,
                        "No frames within heartbeat timeout"
                    );
                    let _ = transport.close().await;
                    return Exit::Retry("heartbeat timeout".to_string());
                }
                frame = transport.receive() => match frame {
                    Ok(Some(frame)) => {
                        deadline = Instant::now() + heartbeat_timeout;
                        if let Some(exit) = self.on_frame(frame) {
                            let _ = transport.close().await;
                            return exit;
                        }
                    }
                    Ok(None) => return Exit::Retry("server closed the stream".to_string()),
                    Err(e) => return Exit::Retry(e.to_string()),
                },
            }
        }
    }

    fn on_frame(&mut self, frame: ServerFrame) -> Option<Exit> {
        match frame {
            ServerFrame::Event(event) => {
                self.on_event(event);
                None
            }
            ServerFrame::Heartbeat(_) => {
                trace!("Heartbeat");
                None
            }
            ServerFrame::Subscribed(ack) => {
                self.apply_ack(&ack);
                None
            }
            ServerFrame::Rejected(rejection) if rejection.task_ids.is_empty() => {
                Some(rejection_exit(rejection))
            }
            ServerFrame::Rejected(rejection) if rejection.status == ResponseStatus::Retryable => {
                Some(Exit::Retry(rejection.message))
            }
            ServerFrame::Rejected(rejection) => {
                let err = StreamError::rejected(rejection.status, rejection.message);
                for task_id in rejection.task_ids {
                    warn!(%task_id, error = %err, "Task subscription rejected");
                    self.end_task(&task_id, err.clone());
                }
                None
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        let task_id = event.task_id.clone();
        let Some(slot) = self.tasks.get_mut(&task_id) else {
            debug!(%task_id, sequence = event.sequence, "Dropping event for unsubscribed task");
            return;
        };
        if slot.lagging {
            trace!(%task_id, sequence = event.sequence, "Dropping event for lagging consumer");
            return;
        }

        match slot.cursor.classify(event.sequence) {
            Delivery::Duplicate => {
                trace!(%task_id, sequence = event.sequence, "Dropping duplicate event");
            }
            Delivery::Straggler => {
                debug!(%task_id, sequence = event.sequence, "Dropping event while resyncing");
            }
            Delivery::Gap { expected, observed } => {
                warn!(%task_id, expected, observed, "Sequence gap, resubscribing");
                self.resubscribe = true;
                let gap = SequenceGap {
                    task_id: task_id.clone(),
                    expected,
                    observed,
                };
                self.deliver(&task_id, Ok(StreamItem::Gap(gap)));
            }
            delivery @ (Delivery::Deliver | Delivery::GiveUp { .. }) => {
                if let Delivery::GiveUp { expected, observed } = delivery {
                    warn!(%task_id, expected, observed, "Gap persisted after resync, skipping ahead");
                }
                let terminal = event.is_terminal();
                self.publish_cursors();
                self.deliver(&task_id, Ok(StreamItem::Event(event)));
                if terminal && self.tasks.contains_key(&task_id) {
                    debug!(%task_id, "Task reached a terminal state");
                    self.finish(&task_id);
                }
            }
        }
    }

    /// Queue an item for the task's consumer without waiting on it.
    ///
    /// Once more than `event_buffer` items are queued behind a full channel
    /// the task is marked lagging and stops taking new events.
    fn deliver(&mut self, task_id: &TaskId, item: Result<StreamItem, StreamError>) {
        let limit = self.config.event_buffer;
        let Some(slot) = self.tasks.get_mut(task_id) else {
            return;
        };
        slot.outbox.push(item);
        match slot.outbox.flush() {
            Flush::Done => {}
            Flush::Blocked => {
                if !slot.lagging && slot.outbox.backlog() > limit {
                    warn!(
                        %task_id,
                        cursor = slot.cursor.cursor(),
                        "Consumer is falling behind, pausing delivery"
                    );
                    slot.lagging = true;
                }
            }
            Flush::Gone => self.drop_consumer(task_id),
        }
    }

    /// Retry every blocked outbox after a consumer made room.
    fn flush_all(&mut self) {
        let mut gone = Vec::new();
        for (task_id, slot) in &mut self.tasks {
            match slot.outbox.flush() {
                Flush::Gone => gone.push(task_id.clone()),
                Flush::Done if slot.lagging => {
                    info!(
                        %task_id,
                        cursor = slot.cursor.cursor(),
                        "Consumer caught up, replaying missed events"
                    );
                    slot.lagging = false;
                    slot.cursor.await_replay();
                    self.resubscribe = true;
                }
                Flush::Done | Flush::Blocked => {}
            }
        }
        for task_id in gone {
            self.drop_consumer(&task_id);
        }

        for ended in &mut self.ended {
            if let Some(outbox) = &mut ended.outbox {
                if !matches!(outbox.flush(), Flush::Blocked) {
                    ended.outbox = None;
                }
            }
        }
    }

    /// Senders of every outbox that is waiting for channel room.
    fn blocked(&self) -> Vec<ItemSender> {
        self.tasks
            .values()
            .map(|slot| &slot.outbox)
            .chain(self.ended.iter().filter_map(|ended| ended.outbox.as_ref()))
            .filter(|outbox| outbox.is_blocked())
            .map(|outbox| outbox.items.clone())
            .collect()
    }

    fn drop_consumer(&mut self, task_id: &TaskId) {
        if self.finish(task_id) {
            debug!(%task_id, "Consumer dropped its events, unsubscribing");
            self.resubscribe = true;
        }
    }

    async fn next_command(&mut self) -> Option<Command> {
        loop {
            let blocked = self.blocked();
            tokio::select! {
                biased;
                command = self.commands.recv() => return command,
                _ = room(blocked) => self.flush_all(),
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                task_id,
                from_cursor,
                reply,
            } => {
                let _ = reply.send(self.add_task(task_id, from_cursor));
            }
            Command::Unsubscribe { task_id } => {
                if self.finish(&task_id) {
                    info!(%task_id, "Task unsubscribed");
                    self.resubscribe = true;
                }
            }
            // Intercepted by every caller.
            Command::Close => {}
        }
    }

    fn add_task(&mut self, task_id: TaskId, from_cursor: u64) -> Result<TaskEvents, StreamError> {
        if self.tasks.contains_key(&task_id) {
            return Err(StreamError::AlreadySubscribed(task_id));
        }
        validate_task_id(&task_id)
            .map_err(|e| StreamError::rejected(ResponseStatus::Validation, e.to_string()))?;

        let (items_tx, items_rx) = mpsc::channel(self.config.event_buffer);
        let (drained_tx, drained_rx) = oneshot::channel();
        self.tasks.insert(
            task_id.clone(),
            TaskSlot {
                cursor: TaskCursor::new(from_cursor),
                outbox: Outbox::new(items_tx),
                drained: drained_rx,
                lagging: false,
            },
        );
        self.resubscribe = true;
        self.publish_cursors();
        debug!(%task_id, from_cursor, "Task subscribed");

        Ok(TaskEvents::new(task_id, items_rx, drained_tx))
    }

    /// Remove a task; its consumer sees the end of the sequence after the
    /// items already queued.
    fn finish(&mut self, task_id: &TaskId) -> bool {
        let Some(slot) = self.tasks.remove(task_id) else {
            return false;
        };
        self.ended.retain_mut(|ended| {
            ended.outbox.is_some()
                || matches!(
                    ended.drained.try_recv(),
                    Err(oneshot::error::TryRecvError::Empty)
                )
        });

        let mut outbox = slot.outbox;
        let outbox = match outbox.flush() {
            Flush::Blocked => Some(outbox),
            Flush::Done | Flush::Gone => None,
        };
        self.ended.push(Ended {
            outbox,
            drained: slot.drained,
        });
        self.publish_cursors();
        true
    }

    /// End one task's sequence with an error.
    fn end_task(&mut self, task_id: &TaskId, err: StreamError) {
        self.deliver(task_id, Err(err));
        self.finish(task_id);
    }

    fn fail_all(&mut self, err: StreamError) {
        let task_ids: Vec<TaskId> = self.tasks.keys().cloned().collect();
        for task_id in task_ids {
            self.end_task(&task_id, err.clone());
        }
    }

    fn give_up(&mut self, outage_start: Instant) {
        let downtime = outage_start.elapsed();
        error!(
            downtime_ms = downtime.as_millis() as u64,
            "Event stream down for too long, giving up"
        );
        self.fail_all(StreamError::Unavailable { downtime });
    }

    fn next_delay(&mut self, outage_start: Instant) -> Option<Duration> {
        let delay = self.backoff.next_delay();
        match self.config.max_downtime {
            None => Some(delay),
            Some(max) => {
                let elapsed = outage_start.elapsed();
                (elapsed < max).then(|| delay.min(max - elapsed))
            }
        }
    }

    fn watchdog_expired(&self, outage_start: Instant) -> bool {
        self.config
            .max_downtime
            .is_some_and(|max| outage_start.elapsed() >= max)
    }

    /// Sleep through a backoff delay while serving commands.
    async fn pause(&mut self, delay: Duration) -> Option<Exit> {
        let wake = tokio::time::sleep(delay);
        tokio::pin!(wake);

        loop {
            let blocked = self.blocked();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(Command::Close) => return Some(Exit::Close),
                    Some(command) => {
                        self.handle(command);
                        if self.tasks.is_empty() {
                            return Some(Exit::Idle);
                        }
                    }
                },
                _ = room(blocked) => self.flush_all(),
                _ = &mut wake => return None,
            }
        }
    }

    fn apply_ack(&mut self, ack: &SubscribeAck) {
        for task_id in &ack.accepted {
            let Some(slot) = self.tasks.get_mut(task_id) else {
                continue;
            };
            slot.cursor.on_ack();
            if let Some(start) = ack.starting_cursors.get(task_id) {
                if *start != slot.cursor.cursor() {
                    debug!(
                        %task_id,
                        server = *start,
                        local = slot.cursor.cursor(),
                        "Server resumes from a different cursor"
                    );
                }
            }
        }
    }

    fn subscribe_frame(&self) -> Result<ClientFrame, StreamError> {
        let request = SubscribeRequest {
            task_ids: self.tasks.keys().cloned().collect(),
            resume_cursors: self
                .tasks
                .iter()
                .map(|(task_id, slot)| (task_id.clone(), slot.cursor.cursor()))
                .collect(),
        };
        encode_subscription(&self.signer, request)
    }

    fn publish_cursors(&self) {
        let snapshot = self
            .tasks
            .iter()
            .map(|(task_id, slot)| (task_id.clone(), slot.cursor.cursor()))
            .collect();
        self.cursors.send_replace(Arc::new(snapshot));
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?current, to = ?state, "Event stream state changed");
            *current = state;
            true
        });
    }

    async fn shutdown(mut self) {
        self.set_state(StreamState::Draining);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Subscribe { reply, .. } = command {
                let _ = reply.send(Err(StreamError::Closed));
            }
        }

        let mut hand_overs: Vec<_> = std::mem::take(&mut self.ended)
            .into_iter()
            .map(|ended| hand_over(ended.outbox, ended.drained))
            .collect();
        hand_overs.extend(
            std::mem::take(&mut self.tasks)
                .into_values()
                .map(|slot| hand_over(Some(slot.outbox), slot.drained)),
        );
        let pending = hand_overs.len();
        let drained = futures::future::join_all(hand_overs);
        if tokio::time::timeout(self.config.drain_timeout, drained)
            .await
            .is_err()
        {
            warn!(pending, "Closing with unread events");
        }

        self.set_state(StreamState::Closed);
        info!("Event stream closed");
    }
}

/// Serialise and sign a subscription request.
fn encode_subscription(
    signer: &Signer,
    request: SubscribeRequest,
) -> Result<ClientFrame, StreamError> {
    let payload = serde_json::to_vec(&request).map_err(|e| StreamError::Encode(e.to_string()))?;
    let signed = signer.sign(&payload);

    Ok(ClientFrame::Subscribe(SubscribeFrame {
        request,
        auth: request_auth(&signed),
    }))
}

/// Resolves once any of the blocked consumers has room, or never if none
/// is blocked.
async fn room(blocked: Vec<ItemSender>) {
    if blocked.is_empty() {
        return std::future::pending().await;
    }
    let waits = blocked.into_iter().map(|items| {
        Box::pin(async move {
            let _ = items.reserve().await;
        })
    });
    futures::future::select_all(waits).await;
}

async fn hand_over(outbox: Option<Outbox>, drained: oneshot::Receiver<()>) {
    if let Some(outbox) = outbox {
        outbox.drain().await;
    }
    let _ = drained.await;
}

fn rejection_exit(rejection: Rejection) -> Exit {
    match rejection.status {
        ResponseStatus::Auth | ResponseStatus::Validation => Exit::Fatal(StreamError::rejected(
            rejection.status,
            rejection.message,
        )),
        ResponseStatus::Retryable | ResponseStatus::Success => {
            Exit::Retry(format!("subscription refused: {}", rejection.message))
        }
    }
}

async fn handshake(
    connector: Arc<dyn StreamConnector>,
    frame: ClientFrame,
    timeout: Duration,
) -> Result<Established, HandshakeError> {
    tokio::time::timeout(timeout, connect_and_subscribe(connector, frame))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Frames other than heartbeats that arrive before the acknowledgement are
/// kept and processed once the connection is up.
async fn connect_and_subscribe(
    connector: Arc<dyn StreamConnector>,
    frame: ClientFrame,
) -> Result<Established, HandshakeError> {
    let mut transport = connector
        .connect()
        .await
        .map_err(HandshakeError::Transport)?;
    transport
        .send(frame)
        .await
        .map_err(HandshakeError::Transport)?;

    let mut early = Vec::new();
    loop {
        match transport.receive().await.map_err(HandshakeError::Transport)? {
            None => {
                return Err(HandshakeError::Transport(TransportError::Lost(
                    "closed during handshake".to_string(),
                )))
            }
            Some(ServerFrame::Subscribed(ack)) => return Ok((transport, ack, early)),
            Some(ServerFrame::Heartbeat(_)) => {}
            Some(ServerFrame::Rejected(rejection)) if rejection.task_ids.is_empty() => {
                return Err(HandshakeError::Rejected(rejection))
            }
            Some(frame) => early.push(frame),
        }
    }
}
