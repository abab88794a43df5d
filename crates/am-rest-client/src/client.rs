//! Signed request/response client with retries

use std::sync::Arc;
use std::time::Duration;

use am_api_contract::validation::{
    validate_claim_request, validate_payload, validate_submit_request, validate_submit_work,
};
use am_api_contract::{
    ApiEnvelope, Attachment, ClaimTaskRequest, Operation, ResponseStatus, SubmitTaskRequest,
    SubmitWorkRequest, Submission, Task, TaskClaim, TaskId, TaskRef, TaskSpec,
};
use am_auth::{SignedRequest, Signer};
use am_client_api::{ApiError, ApiRequest, ApiResult, RawResponse, RequestTransport};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::auth::request_auth;
use crate::backoff::Backoff;
use crate::config::{ClientConfig, RetryPolicy};
use crate::error::ConfigError;
use crate::http::HttpTransport;

/// A successful response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub body: Vec<u8>,
}

impl Response {
    /// Decode the `data` field of the response envelope.
    pub fn data<T: DeserializeOwned>(&self) -> ApiResult<T> {
        self.optional_data()?
            .ok_or_else(|| ApiError::UnexpectedResponse("envelope has no data".to_string()))
    }

    /// Decode the `data` field, which may be absent or `null`.
    pub fn optional_data<T: DeserializeOwned>(&self) -> ApiResult<Option<T>> {
        let envelope: ApiEnvelope<T> = serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::UnexpectedResponse(format!("invalid envelope: {e}")))?;
        if !envelope.success {
            return Err(ApiError::UnexpectedResponse(
                "success status with a failed envelope".to_string(),
            ));
        }
        Ok(envelope.data)
    }
}

/// A failed attempt, with the server's retry hint if it sent one.
struct AttemptError {
    error: ApiError,
    retry_after: Option<Duration>,
}

impl From<ApiError> for AttemptError {
    fn from(error: ApiError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Request/response client for the marketplace API
///
/// Every attempt is signed afresh, so retries never reuse a nonce.
#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn RequestTransport>,
    signer: Signer,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RequestClient {
    pub fn new(transport: Arc<dyn RequestTransport>, signer: Signer, config: &ClientConfig) -> Self {
        Self {
            transport,
            signer,
            retry: config.retry,
            timeout: config.request_timeout,
        }
    }

    /// Client talking HTTP to `config.base_url`.
    pub fn over_http(config: &ClientConfig, signer: Signer) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = HttpTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), signer, config))
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Sign and send `payload`, retrying retryable failures.
    pub async fn call(&self, operation: Operation, payload: Vec<u8>) -> ApiResult<Response> {
        self.call_with_timeout(operation, payload, self.timeout).await
    }

    /// Like [`Self::call`] with an explicit per-attempt timeout.
    pub async fn call_with_timeout(
        &self,
        operation: Operation,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ApiResult<Response> {
        validate_payload(operation, &payload)?;

        let mut backoff = Backoff::new(self.retry.backoff);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let signed = self.signer.sign(&payload);
            debug!(%operation, attempt, nonce = %signed.nonce_base64(), "Sending request");

            match self.attempt(operation, &signed, timeout).await {
                Ok(response) => return Ok(response),
                Err(failure) if failure.error.is_retryable() && attempt <= self.retry.max_retries => {
                    let delay = backoff.next_delay_at_least(failure.retry_after);
                    warn!(
                        %operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return Err(with_attempts(failure.error, attempt)),
            }
        }
    }

    /// Send an already signed request exactly once.
    ///
    /// Nothing is re-signed, so a second send of the same request carries
    /// the same nonce and is expected to be refused by the server.
    pub async fn send_signed(
        &self,
        operation: Operation,
        signed: &SignedRequest,
    ) -> ApiResult<Response> {
        validate_payload(operation, &signed.payload)?;
        self.attempt(operation, signed, self.timeout)
            .await
            .map_err(|failure| with_attempts(failure.error, 1))
    }

    async fn attempt(
        &self,
        operation: Operation,
        signed: &SignedRequest,
        timeout: Duration,
    ) -> Result<Response, AttemptError> {
        let request = ApiRequest {
            operation,
            payload: signed.payload.clone(),
            auth: request_auth(signed),
        };

        let raw = match tokio::time::timeout(timeout, self.transport.call(request)).await {
            Err(_) => return Err(ApiError::Timeout { duration: timeout }.into()),
            Ok(Err(e)) => return Err(ApiError::Transport(e).into()),
            Ok(Ok(raw)) => raw,
        };

        classify(raw)
    }

    pub async fn submit_task(&self, spec: &TaskSpec, idempotency_key: &str) -> ApiResult<Task> {
        let request = SubmitTaskRequest {
            idempotency_key: idempotency_key.to_string(),
            spec: spec.clone(),
        };
        validate_submit_request(&request)?;

        let payload = serde_json::to_vec(&request)
            .map_err(|e| ApiError::validation("invalid_request", e.to_string()))?;
        let task: Task = self.call(Operation::SubmitTask, payload).await?.data()?;
        info!(task_id = %task.id, "Task submitted");
        Ok(task)
    }

    pub async fn get_task_status(&self, task_id: &TaskId) -> ApiResult<Task> {
        let payload = task_ref_payload(task_id)?;
        self.call(Operation::GetTaskStatus, payload).await?.data()
    }

    pub async fn cancel_task(&self, task_id: &TaskId) -> ApiResult<Task> {
        let payload = task_ref_payload(task_id)?;
        let task: Task = self.call(Operation::CancelTask, payload).await?.data()?;
        info!(task_id = %task.id, state = %task.state, "Task cancel requested");
        Ok(task)
    }

    /// Claim a pending task for the agent identified by the signing key.
    ///
    /// Claiming a task this agent already holds returns the existing claim,
    /// so retries are safe.
    pub async fn claim_task(&self, task_id: &TaskId) -> ApiResult<TaskClaim> {
        let request = ClaimTaskRequest {
            task_id: task_id.clone(),
            agent_id: self.signer.key_id().to_string(),
        };
        validate_claim_request(&request)?;

        let payload = serde_json::to_vec(&request)
            .map_err(|e| ApiError::validation("invalid_request", e.to_string()))?;
        let claim: TaskClaim = self.call(Operation::ClaimTask, payload).await?.data()?;
        info!(task_id = %claim.task_id, agent_id = %claim.agent_id, "Task claimed");
        Ok(claim)
    }

    /// Submit the result of a claimed task.
    pub async fn submit_work(
        &self,
        task_id: &TaskId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> ApiResult<Submission> {
        let request = SubmitWorkRequest {
            task_id: task_id.clone(),
            agent_id: self.signer.key_id().to_string(),
            content: content.into(),
            attachments,
        };
        validate_submit_work(&request)?;

        let payload = serde_json::to_vec(&request)
            .map_err(|e| ApiError::validation("invalid_request", e.to_string()))?;
        let submission: Submission = self.call(Operation::SubmitWork, payload).await?.data()?;
        info!(
            task_id = %submission.task_id,
            attachments = submission.attachments.len(),
            "Work submitted"
        );
        Ok(submission)
    }

    /// The work submitted for a task, if any.
    pub async fn get_submission(&self, task_id: &TaskId) -> ApiResult<Option<Submission>> {
        let payload = task_ref_payload(task_id)?;
        self.call(Operation::GetSubmission, payload)
            .await?
            .optional_data()
    }
}

impl std::fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestClient")
            .field("key_id", &self.signer.key_id())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn task_ref_payload(task_id: &TaskId) -> ApiResult<Vec<u8>> {
    am_api_contract::validation::validate_task_id(task_id)?;
    serde_json::to_vec(&TaskRef {
        task_id: task_id.clone(),
    })
    .map_err(|e| ApiError::validation("invalid_request", e.to_string()))
}

/// Map a raw response onto success or an error class.
fn classify(raw: RawResponse) -> Result<Response, AttemptError> {
    let (code, message) = match raw.status {
        ResponseStatus::Success => return Ok(Response { body: raw.body }),
        _ => error_body(&raw.body),
    };

    let error = match raw.status {
        ResponseStatus::Auth => ApiError::Auth { code, message },
        ResponseStatus::Validation => ApiError::Validation { code, message },
        ResponseStatus::Retryable | ResponseStatus::Success => ApiError::Retryable {
            code,
            message,
            attempts: 1,
        },
    };
    Err(AttemptError {
        error,
        retry_after: raw.retry_after,
    })
}

fn error_body(body: &[u8]) -> (String, String) {
    match serde_json::from_slice::<ApiEnvelope<serde_json::Value>>(body) {
        Ok(ApiEnvelope {
            error: Some(error), ..
        }) => (error.code, error.message),
        _ => (
            "unknown".to_string(),
            String::from_utf8_lossy(body).into_owned(),
        ),
    }
}

fn with_attempts(error: ApiError, attempts: u32) -> ApiError {
    match error {
        ApiError::Retryable { code, message, .. } => ApiError::Retryable {
            code,
            message,
            attempts,
        },
        other => other,
    }
}
