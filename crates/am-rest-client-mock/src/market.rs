//! In-memory marketplace serving both the request API and the event feed

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use am_api_contract::validation::{
    validate_claim_request, validate_submit_request, validate_submit_work,
    validate_subscribe_request,
};
use am_api_contract::*;
use am_auth::{PublicKey, SignedRequest, Verifier};
use am_client_api::{
    ApiRequest, RawResponse, RequestTransport, StreamConnector, StreamTransport, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};

const LIVE_CAPACITY: usize = 1024;

/// A failure served instead of the next request
#[derive(Debug, Clone)]
pub enum InjectedFailure {
    Status {
        status: ResponseStatus,
        retry_after: Option<Duration>,
    },
    Transport(TransportError),
    /// Never answer.
    Stall,
}

impl InjectedFailure {
    pub fn status(status: ResponseStatus) -> Self {
        Self::Status {
            status,
            retry_after: None,
        }
    }
}

#[derive(Default)]
struct MarketState {
    tasks: HashMap<TaskId, Task>,
    logs: HashMap<TaskId, Vec<Event>>,
    idempotency: HashMap<String, TaskId>,
    claims: HashMap<TaskId, TaskClaim>,
    submissions: HashMap<TaskId, Submission>,
    next_id: u64,
    failures: VecDeque<InjectedFailure>,
    request_counts: HashMap<Operation, usize>,
    subscriptions: Vec<SubscribeRequest>,
    refuse_connects: usize,
    connects: usize,
}

struct Market {
    verifier: Verifier,
    state: Mutex<MarketState>,
    live: broadcast::Sender<Event>,
    drops: watch::Sender<u64>,
    heartbeat_interval: Duration,
}

/// Marketplace double that verifies signatures, deduplicates submissions
/// by idempotency key and replays task events after a resume cursor.
#[derive(Clone)]
pub struct MockMarketplace {
    inner: Arc<Market>,
}

impl MockMarketplace {
    /// Accept requests signed by the holder of `public_key`.
    pub fn new(public_key: PublicKey) -> Self {
        Self::with_heartbeat_interval(public_key, Duration::from_secs(5))
    }

    pub fn with_heartbeat_interval(public_key: PublicKey, heartbeat_interval: Duration) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        let (drops, _) = watch::channel(0);
        Self {
            inner: Arc::new(Market {
                verifier: Verifier::new(public_key),
                state: Mutex::new(MarketState::default()),
                live,
                drops,
                heartbeat_interval,
            }),
        }
    }

    /// Serve `failure` in place of the next request.
    pub async fn inject(&self, failure: InjectedFailure) {
        self.inner.state.lock().await.failures.push_back(failure);
    }

    /// Requests received for an operation, including failed ones.
    pub async fn request_count(&self, operation: Operation) -> usize {
        let state = self.inner.state.lock().await;
        state.request_counts.get(&operation).copied().unwrap_or(0)
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        self.inner.state.lock().await.tasks.get(task_id).cloned()
    }

    pub async fn claim(&self, task_id: &TaskId) -> Option<TaskClaim> {
        self.inner.state.lock().await.claims.get(task_id).cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.inner.state.lock().await.tasks.len()
    }

    /// Subscribe requests received on the event feed, oldest first.
    pub async fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.inner.state.lock().await.subscriptions.clone()
    }

    /// Successful stream connects so far.
    pub async fn connection_count(&self) -> usize {
        self.inner.state.lock().await.connects
    }

    /// Fail the next `count` stream connect attempts.
    pub async fn refuse_connections(&self, count: usize) {
        self.inner.state.lock().await.refuse_connects += count;
    }

    /// Break every open stream connection.
    pub fn drop_connections(&self) {
        self.inner.drops.send_modify(|generation| *generation += 1);
    }

    pub async fn transition(&self, task_id: &TaskId, state: TaskState) -> Option<Event> {
        self.append(task_id, |seq| Event::transition(task_id.clone(), seq, state))
            .await
    }

    pub async fn progress(&self, task_id: &TaskId, payload: serde_json::Value) -> Option<Event> {
        self.append(task_id, |seq| Event::progress(task_id.clone(), seq, payload))
            .await
    }

    pub async fn result_chunk(
        &self,
        task_id: &TaskId,
        payload: serde_json::Value,
    ) -> Option<Event> {
        self.append(task_id, |seq| {
            Event::result_chunk(task_id.clone(), seq, payload)
        })
        .await
    }

    /// Record an event in the task's log without publishing it live, so
    /// connected clients only see it through a replay.
    pub async fn record_silently(&self, task_id: &TaskId, state: TaskState) -> Option<Event> {
        let mut market = self.inner.state.lock().await;
        append_locked(&mut market, task_id, |seq| {
            Event::transition(task_id.clone(), seq, state)
        })
    }

    async fn append(&self, task_id: &TaskId, build: impl FnOnce(u64) -> Event) -> Option<Event> {
        let event = {
            let mut market = self.inner.state.lock().await;
            append_locked(&mut market, task_id, build)?
        };
        let _ = self.inner.live.send(event.clone());
        Some(event)
    }

    fn authenticate(&self, payload: &[u8], auth: &RequestAuth) -> Result<(), String> {
        let signed = SignedRequest::from_encoded(
            payload.to_vec(),
            auth.key_id.clone(),
            auth.timestamp,
            &auth.nonce,
            &auth.signature,
        )
        .map_err(|e| e.to_string())?;
        self.inner.verifier.verify(&signed).map_err(|e| e.to_string())
    }

    async fn handle(&self, request: ApiRequest) -> RawResponse {
        if let Err(reason) = self.authenticate(&request.payload, &request.auth) {
            return error_response(ResponseStatus::Auth, "unauthorized", &reason);
        }

        let mut market = self.inner.state.lock().await;
        match request.operation {
            Operation::SubmitTask => {
                let submit: SubmitTaskRequest = match serde_json::from_slice(&request.payload) {
                    Ok(submit) => submit,
                    Err(e) => return bad_request(&e.to_string()),
                };
                if let Err(e) = validate_submit_request(&submit) {
                    return bad_request(&e.to_string());
                }

                if let Some(existing) = market.idempotency.get(&submit.idempotency_key) {
                    if let Some(task) = market.tasks.get(existing) {
                        return success(task);
                    }
                }

                market.next_id += 1;
                let task = Task {
                    id: TaskId::new(format!("T{}", market.next_id)),
                    spec: submit.spec,
                    state: TaskState::Pending,
                    cursor: 0,
                    created_at: Some(chrono::Utc::now()),
                };
                market
                    .idempotency
                    .insert(submit.idempotency_key, task.id.clone());
                market.tasks.insert(task.id.clone(), task.clone());
                success(&task)
            }
            Operation::GetTaskStatus => match task_ref(&request.payload) {
                Ok(task_id) => match market.tasks.get(&task_id) {
                    Some(task) => success(task),
                    None => not_found(&task_id),
                },
                Err(response) => response,
            },
            Operation::CancelTask => {
                let task_id = match task_ref(&request.payload) {
                    Ok(task_id) => task_id,
                    Err(response) => return response,
                };
                let Some(task) = market.tasks.get(&task_id) else {
                    return not_found(&task_id);
                };
                if task.state.is_terminal() {
                    return success(task);
                }

                let event = append_locked(&mut market, &task_id, |seq| {
                    Event::transition(task_id.clone(), seq, TaskState::Cancelled)
                });
                let task = market.tasks.get(&task_id).cloned();
                drop(market);

                if let Some(event) = event {
                    let _ = self.inner.live.send(event);
                }
                match task {
                    Some(task) => success(&task),
                    None => not_found(&task_id),
                }
            }
            Operation::ClaimTask => {
                let claim: ClaimTaskRequest = match serde_json::from_slice(&request.payload) {
                    Ok(claim) => claim,
                    Err(e) => return bad_request(&e.to_string()),
                };
                if let Err(e) = validate_claim_request(&claim) {
                    return bad_request(&e.to_string());
                }
                if claim.agent_id != request.auth.key_id {
                    return error_response(
                        ResponseStatus::Auth,
                        "agent_mismatch",
                        "agent id does not match the signing key",
                    );
                }
                let Some(task) = market.tasks.get(&claim.task_id) else {
                    return not_found(&claim.task_id);
                };

                if let Some(existing) = market.claims.get(&claim.task_id) {
                    if existing.agent_id == claim.agent_id {
                        return success(existing);
                    }
                    return conflict(&format!(
                        "task {} is claimed by another agent",
                        claim.task_id
                    ));
                }
                if task.state != TaskState::Pending {
                    return conflict(&format!("task {} is {}", claim.task_id, task.state));
                }

                let record = TaskClaim {
                    task_id: claim.task_id.clone(),
                    agent_id: claim.agent_id.clone(),
                    claimed_at: chrono::Utc::now(),
                };
                let event = append_locked(&mut market, &claim.task_id, |seq| {
                    Event::transition(claim.task_id.clone(), seq, TaskState::Running)
                        .with_payload(serde_json::json!({ "agentId": claim.agent_id }))
                });
                market.claims.insert(claim.task_id.clone(), record.clone());
                drop(market);

                if let Some(event) = event {
                    let _ = self.inner.live.send(event);
                }
                success(&record)
            }
            Operation::SubmitWork => {
                let work: SubmitWorkRequest = match serde_json::from_slice(&request.payload) {
                    Ok(work) => work,
                    Err(e) => return bad_request(&e.to_string()),
                };
                if let Err(e) = validate_submit_work(&work) {
                    return bad_request(&e.to_string());
                }
                if work.agent_id != request.auth.key_id {
                    return error_response(
                        ResponseStatus::Auth,
                        "agent_mismatch",
                        "agent id does not match the signing key",
                    );
                }
                let Some(task) = market.tasks.get(&work.task_id) else {
                    return not_found(&work.task_id);
                };

                if let Some(existing) = market.submissions.get(&work.task_id) {
                    if existing.matches(&work) {
                        return success(existing);
                    }
                    return conflict(&format!(
                        "task {} already has a submission",
                        work.task_id
                    ));
                }
                let claimed_by_sender = market
                    .claims
                    .get(&work.task_id)
                    .is_some_and(|claim| claim.agent_id == work.agent_id);
                if !claimed_by_sender {
                    return conflict(&format!(
                        "task {} is not claimed by this agent",
                        work.task_id
                    ));
                }
                if task.state != TaskState::Running {
                    return conflict(&format!("task {} is {}", work.task_id, task.state));
                }

                let submission = Submission {
                    task_id: work.task_id.clone(),
                    agent_id: work.agent_id.clone(),
                    content: work.content,
                    attachments: work.attachments,
                    submitted_at: chrono::Utc::now(),
                };
                let event = append_locked(&mut market, &work.task_id, |seq| {
                    Event::result_chunk(
                        work.task_id.clone(),
                        seq,
                        serde_json::json!({
                            "agentId": submission.agent_id,
                            "attachments": submission.attachments.len(),
                        }),
                    )
                });
                market
                    .submissions
                    .insert(work.task_id.clone(), submission.clone());
                drop(market);

                if let Some(event) = event {
                    let _ = self.inner.live.send(event);
                }
                success(&submission)
            }
            Operation::GetSubmission => match task_ref(&request.payload) {
                Ok(task_id) if market.tasks.contains_key(&task_id) => {
                    success(&market.submissions.get(&task_id))
                }
                Ok(task_id) => not_found(&task_id),
                Err(response) => response,
            },
        }
    }
}

fn append_locked(
    market: &mut MarketState,
    task_id: &TaskId,
    build: impl FnOnce(u64) -> Event,
) -> Option<Event> {
    let task = market.tasks.get_mut(task_id)?;
    let log = market.logs.entry(task_id.clone()).or_default();
    let event = build(log.len() as u64 + 1);

    task.cursor = event.sequence;
    if let Some(state) = event.new_state() {
        task.state = state;
    }
    log.push(event.clone());
    Some(event)
}

fn task_ref(payload: &[u8]) -> Result<TaskId, RawResponse> {
    serde_json::from_slice::<TaskRef>(payload)
        .map(|r| r.task_id)
        .map_err(|e| bad_request(&e.to_string()))
}

fn success<T: Serialize>(data: &T) -> RawResponse {
    RawResponse {
        status: ResponseStatus::Success,
        retry_after: None,
        body: serde_json::to_vec(&ApiEnvelope::ok(data)).unwrap_or_default(),
    }
}

fn error_response(status: ResponseStatus, code: &str, message: &str) -> RawResponse {
    RawResponse {
        status,
        retry_after: None,
        body: serde_json::to_vec(&ApiEnvelope::<()>::err(ApiErrorBody::new(code, message)))
            .unwrap_or_default(),
    }
}

fn bad_request(message: &str) -> RawResponse {
    error_response(ResponseStatus::Validation, "invalid_request", message)
}

fn conflict(message: &str) -> RawResponse {
    error_response(ResponseStatus::Validation, "conflict", message)
}

fn not_found(task_id: &TaskId) -> RawResponse {
    error_response(
        ResponseStatus::Validation,
        "not_found",
        &format!("task {task_id} not found"),
    )
}

#[async_trait]
impl RequestTransport for MockMarketplace {
    async fn call(&self, request: ApiRequest) -> TransportResult<RawResponse> {
        let failure = {
            let mut market = self.inner.state.lock().await;
            *market.request_counts.entry(request.operation).or_default() += 1;
            market.failures.pop_front()
        };

        match failure {
            None => Ok(self.handle(request).await),
            Some(InjectedFailure::Status {
                status,
                retry_after,
            }) => {
                let mut response = error_response(status, "injected", "injected failure");
                response.retry_after = retry_after;
                Ok(response)
            }
            Some(InjectedFailure::Transport(e)) => Err(e),
            Some(InjectedFailure::Stall) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl StreamConnector for MockMarketplace {
    async fn connect(&self) -> TransportResult<Box<dyn StreamTransport>> {
        let mut market = self.inner.state.lock().await;
        if market.refuse_connects > 0 {
            market.refuse_connects -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        market.connects += 1;

        Ok(Box::new(MarketStream {
            market: self.clone(),
            outbox: VecDeque::new(),
            subscribed: BTreeSet::new(),
            live: self.inner.live.subscribe(),
            drops: self.inner.drops.subscribe(),
        }))
    }
}

/// One client connection to the mock event feed
struct MarketStream {
    market: MockMarketplace,
    outbox: VecDeque<ServerFrame>,
    subscribed: BTreeSet<TaskId>,
    live: broadcast::Receiver<Event>,
    drops: watch::Receiver<u64>,
}

#[async_trait]
impl StreamTransport for MarketStream {
    async fn send(&mut self, frame: ClientFrame) -> TransportResult<()> {
        let ClientFrame::Subscribe(subscribe) = frame;
        let payload = serde_json::to_vec(&subscribe.request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if let Err(reason) = self.market.authenticate(&payload, &subscribe.auth) {
            self.outbox.push_back(ServerFrame::Rejected(Rejection {
                status: ResponseStatus::Auth,
                message: reason,
                task_ids: Vec::new(),
            }));
            return Ok(());
        }

        let request = subscribe.request;
        if let Err(e) = validate_subscribe_request(&request) {
            self.outbox.push_back(ServerFrame::Rejected(Rejection {
                status: ResponseStatus::Validation,
                message: e.to_string(),
                task_ids: Vec::new(),
            }));
            return Ok(());
        }

        let market = self.market.inner.state.lock().await;
        let (known, unknown): (Vec<TaskId>, Vec<TaskId>) = request
            .task_ids
            .iter()
            .cloned()
            .partition(|task_id| market.tasks.contains_key(task_id));

        let starting_cursors = known
            .iter()
            .map(|task_id| {
                let cursor = request.resume_cursors.get(task_id).copied().unwrap_or(0);
                (task_id.clone(), cursor)
            })
            .collect();
        self.outbox.push_back(ServerFrame::Subscribed(SubscribeAck {
            accepted: known.clone(),
            starting_cursors,
        }));
        if !unknown.is_empty() {
            self.outbox.push_back(ServerFrame::Rejected(Rejection {
                status: ResponseStatus::Validation,
                message: "unknown task".to_string(),
                task_ids: unknown,
            }));
        }

        for task_id in &known {
            let cursor = request.resume_cursors.get(task_id).copied().unwrap_or(0);
            let replay = market
                .logs
                .get(task_id)
                .into_iter()
                .flatten()
                .filter(|event| event.sequence > cursor)
                .cloned()
                .map(ServerFrame::Event);
            self.outbox.extend(replay);
        }

        self.subscribed = known.into_iter().collect();
        drop(market);
        self.market.inner.state.lock().await.subscriptions.push(request);
        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Option<ServerFrame>> {
        loop {
            if let Some(frame) = self.outbox.pop_front() {
                return Ok(Some(frame));
            }

            let heartbeat = self.market.inner.heartbeat_interval;
            tokio::select! {
                changed = self.drops.changed() => {
                    return match changed {
                        Ok(()) => Err(TransportError::Lost("dropped by server".to_string())),
                        Err(_) => Ok(None),
                    };
                }
                event = self.live.recv() => match event {
                    Ok(event) if self.subscribed.contains(&event.task_id) => {
                        return Ok(Some(ServerFrame::Event(event)));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Ok(None),
                },
                _ = tokio::time::sleep(heartbeat) => return Ok(Some(ServerFrame::heartbeat())),
            }
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.subscribed.clear();
        Ok(())
    }
}
