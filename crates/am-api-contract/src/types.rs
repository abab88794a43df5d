//! API contract types for the agent-market task service

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use crate::error::{ApiContractError, ApiErrorBody};

/// Opaque, server-assigned task identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Terminal states end the task's event sequence.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = ApiContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ApiContractError::InvalidTaskState(other.to_string())),
        }
    }
}

/// Request/response operations exposed by the marketplace API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    SubmitTask,
    GetTaskStatus,
    CancelTask,
    ClaimTask,
    SubmitWork,
    GetSubmission,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubmitTask => "submitTask",
            Self::GetTaskStatus => "getTaskStatus",
            Self::CancelTask => "cancelTask",
            Self::ClaimTask => "claimTask",
            Self::SubmitWork => "submitWork",
            Self::GetSubmission => "getSubmission",
        }
    }

    /// API path the operation is posted to, relative to the base URL.
    pub fn path(self) -> &'static str {
        match self {
            Self::SubmitTask => "tasks",
            Self::GetTaskStatus => "tasks/status",
            Self::CancelTask => "tasks/cancel",
            Self::ClaimTask => "tasks/claim",
            Self::SubmitWork => "tasks/submit",
            Self::GetSubmission => "tasks/submission",
        }
    }

    /// Mutating operations change task state on the server and must carry
    /// a non-empty payload.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::SubmitTask | Self::CancelTask | Self::ClaimTask | Self::SubmitWork
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ApiContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitTask" => Ok(Self::SubmitTask),
            "getTaskStatus" => Ok(Self::GetTaskStatus),
            "cancelTask" => Ok(Self::CancelTask),
            "claimTask" => Ok(Self::ClaimTask),
            "submitWork" => Ok(Self::SubmitWork),
            "getSubmission" => Ok(Self::GetSubmission),
            other => Err(ApiContractError::InvalidOperation(other.to_string())),
        }
    }
}

/// Caller-defined task description. The client never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskSpec(serde_json::Value);

impl TaskSpec {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Build a spec from any serializable caller type.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, ApiContractError> {
        Ok(Self(serde_json::to_value(value)?))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl From<serde_json::Value> for TaskSpec {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Task submission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskRequest {
    #[validate(length(min = 1, max = 128, message = "Idempotency key must be 1-128 characters"))]
    pub idempotency_key: String,
    pub spec: TaskSpec,
}

/// Payload for operations addressing an existing task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub task_id: TaskId,
}

/// Server view of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    /// Sequence number of the last event recorded for this task.
    #[serde(default)]
    pub cursor: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Request by an agent to take on a pending task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTaskRequest {
    pub task_id: TaskId,
    /// Must match the key id the request is signed with.
    #[validate(length(min = 1, max = 256, message = "Agent id must be 1-256 characters"))]
    pub agent_id: String,
}

/// A task held by one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskClaim {
    pub task_id: TaskId,
    pub agent_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// A file delivered alongside a work submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[validate(length(min = 1, max = 255, message = "Attachment name must be 1-255 characters"))]
    pub name: String,
    /// MIME type.
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 255, message = "Attachment type must be 1-255 characters"))]
    pub content_type: String,
    /// Base64 file content.
    pub content: String,
    /// Decoded size in bytes.
    pub size: u64,
}

impl Attachment {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            content: STANDARD.encode(bytes),
            size: bytes.len() as u64,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, ApiContractError> {
        STANDARD.decode(&self.content).map_err(|e| {
            ApiContractError::InvalidAttachment(format!(
                "{}: content is not base64: {e}",
                self.name
            ))
        })
    }
}

/// Work result for a claimed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitWorkRequest {
    pub task_id: TaskId,
    #[validate(length(min = 1, max = 256, message = "Agent id must be 1-256 characters"))]
    pub agent_id: String,
    #[validate(length(min = 1, message = "Submission content cannot be empty"))]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub attachments: Vec<Attachment>,
}

/// Server record of submitted work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub task_id: TaskId,
    pub agent_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub submitted_at: DateTime<Utc>,
}

impl Submission {
    /// Whether `request` asks for exactly this submission again.
    pub fn matches(&self, request: &SubmitWorkRequest) -> bool {
        self.task_id == request.task_id
            && self.agent_id == request.agent_id
            && self.content == request.content
            && self.attachments == request.attachments
    }
}

/// Event kinds carried on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateTransition,
    Progress,
    ResultChunk,
}

/// Task lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub task_id: TaskId,
    pub sequence: u64,
    pub kind: EventKind,
    /// New state, present on `state_transition` events.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<TaskState>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn transition(task_id: TaskId, sequence: u64, state: TaskState) -> Self {
        Self {
            task_id,
            sequence,
            kind: EventKind::StateTransition,
            state: Some(state),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn progress(task_id: TaskId, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            task_id,
            sequence,
            kind: EventKind::Progress,
            state: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn result_chunk(task_id: TaskId, sequence: u64, payload: serde_json::Value) -> Self {
        Self {
            task_id,
            sequence,
            kind: EventKind::ResultChunk,
            state: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// The state this event moves the task into, if it is a transition.
    pub fn new_state(&self) -> Option<TaskState> {
        match self.kind {
            EventKind::StateTransition => self.state,
            _ => None,
        }
    }

    /// True when the event moves its task into a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.new_state().is_some_and(TaskState::is_terminal)
    }
}

/// Authentication fields attached to every signed request and subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAuth {
    pub key_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Base64 nonce.
    pub nonce: String,
    /// Base64 Ed25519 signature.
    pub signature: String,
}

/// Signable part of a subscription handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub task_ids: Vec<TaskId>,
    /// Last processed sequence per task; the server replays everything after it.
    pub resume_cursors: BTreeMap<TaskId, u64>,
}

/// Subscription handshake frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeFrame {
    pub request: SubscribeRequest,
    pub auth: RequestAuth,
}

/// Subscription acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub accepted: Vec<TaskId>,
    #[serde(default)]
    pub starting_cursors: BTreeMap<TaskId, u64>,
}

/// Subscription rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub status: ResponseStatus,
    pub message: String,
    /// Tasks the rejection applies to; empty means the whole connection.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub task_ids: Vec<TaskId>,
}

/// Server liveness ping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
}

/// Frames sent by the client on the event stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe(SubscribeFrame),
}

/// Frames pushed by the server on the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed(SubscribeAck),
    Rejected(Rejection),
    Event(Event),
    Heartbeat(Heartbeat),
}

impl ServerFrame {
    pub fn heartbeat() -> Self {
        Self::Heartbeat(Heartbeat {
            timestamp: Utc::now(),
        })
    }
}

/// Classification of a request/response outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Retryable,
    Auth,
    Validation,
}

impl ResponseStatus {
    /// Map an HTTP status code onto the response classification.
    pub fn from_http(code: u16) -> Self {
        match code {
            200..=299 => Self::Success,
            401 | 403 => Self::Auth,
            408 | 425 | 429 => Self::Retryable,
            500..=599 => Self::Retryable,
            _ => Self::Validation,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Response envelope used by every API response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ApiErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_parsing() {
        let json = r#"{
            "type": "event",
            "taskId": "T1",
            "sequence": 2,
            "kind": "state_transition",
            "state": "completed",
            "payload": {"result": 3},
            "timestamp": "2025-01-01T12:00:00Z"
        }"#;

        let frame: ServerFrame = serde_json::from_str(json).unwrap();
        match frame {
            ServerFrame::Event(event) => {
                assert_eq!(event.task_id, TaskId::from("T1"));
                assert_eq!(event.sequence, 2);
                assert_eq!(event.new_state(), Some(TaskState::Completed));
                assert!(event.is_terminal());
                assert_eq!(event.payload["result"], 3);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_frame_parsing() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"heartbeat","timestamp":"2025-01-01T12:00:00Z"}"#)
                .unwrap();
        assert!(matches!(frame, ServerFrame::Heartbeat(_)));
    }

    #[test]
    fn test_progress_event_is_not_terminal() {
        let event = Event::progress("T1".into(), 4, serde_json::json!({"pct": 50}));
        assert_eq!(event.new_state(), None);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let mut cursors = BTreeMap::new();
        cursors.insert(TaskId::from("T1"), 2);
        let frame = ClientFrame::Subscribe(SubscribeFrame {
            request: SubscribeRequest {
                task_ids: vec!["T1".into()],
                resume_cursors: cursors,
            },
            auth: RequestAuth {
                key_id: "k".into(),
                timestamp: 1,
                nonce: "n".into(),
                signature: "s".into(),
            },
        });

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["request"]["resumeCursors"]["T1"], 2);
    }

    #[test]
    fn test_response_status_from_http() {
        assert_eq!(ResponseStatus::from_http(201), ResponseStatus::Success);
        assert_eq!(ResponseStatus::from_http(401), ResponseStatus::Auth);
        assert_eq!(ResponseStatus::from_http(403), ResponseStatus::Auth);
        assert_eq!(ResponseStatus::from_http(429), ResponseStatus::Retryable);
        assert_eq!(ResponseStatus::from_http(503), ResponseStatus::Retryable);
        assert_eq!(ResponseStatus::from_http(422), ResponseStatus::Validation);
        assert_eq!(ResponseStatus::from_http(409), ResponseStatus::Validation);
    }

    #[test]
    fn test_task_state_round_trip_str() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("claimed".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_operation_names_round_trip() {
        for operation in [
            Operation::SubmitTask,
            Operation::GetTaskStatus,
            Operation::CancelTask,
            Operation::ClaimTask,
            Operation::SubmitWork,
            Operation::GetSubmission,
        ] {
            assert_eq!(operation.as_str().parse::<Operation>().unwrap(), operation);
            assert!(!operation.path().starts_with('/'));
        }
        assert!(Operation::ClaimTask.is_mutating());
        assert!(!Operation::GetSubmission.is_mutating());
    }

    #[test]
    fn test_attachment_wire_shape() {
        let attachment = Attachment::from_bytes("out.txt", "text/plain", b"hello");
        let value = serde_json::to_value(&attachment).unwrap();
        assert_eq!(value["type"], "text/plain");
        assert_eq!(value["content"], "aGVsbG8=");
        assert_eq!(value["size"], 5);
        assert_eq!(attachment.decode().unwrap(), b"hello");
    }
}
