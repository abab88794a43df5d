//! Request client behaviour against the in-memory marketplace

use std::sync::Arc;
use std::time::Duration;

use am_api_contract::*;
use am_auth::{Credential, Signer};
use am_rest_client::config::DEFAULT_BASE_URL;
use am_rest_client::{ApiError, BackoffConfig, ClientConfig, RequestClient, TransportError};
use am_rest_client_mock::{InjectedFailure, MockMarketplace};
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> ClientConfig {
    ClientConfig::from_url(DEFAULT_BASE_URL)
        .unwrap()
        .retry_backoff(BackoffConfig::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
        ))
}

fn setup_with(config: &ClientConfig) -> (MockMarketplace, RequestClient) {
    init_tracing();
    let signer = Signer::new(Credential::generate());
    let market = MockMarketplace::new(signer.public_key());
    let client = RequestClient::new(Arc::new(market.clone()), signer, config);
    (market, client)
}

fn setup() -> (MockMarketplace, RequestClient) {
    setup_with(&config())
}

fn sum_spec() -> TaskSpec {
    TaskSpec::new(serde_json::json!({"op": "sum", "args": [1, 2]}))
}

#[tokio::test(start_paused = true)]
async fn test_submit_then_status() {
    let (market, client) = setup();

    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();
    assert_eq!(task.id, TaskId::from("T1"));
    assert_eq!(task.state, TaskState::Pending);

    market.transition(&task.id, TaskState::Running).await.unwrap();
    let status = client.get_task_status(&task.id).await.unwrap();
    assert_eq!(status.state, TaskState::Running);
    assert_eq!(status.cursor, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_are_retried_then_succeed() {
    let (market, client) = setup();
    market
        .inject(InjectedFailure::status(ResponseStatus::Retryable))
        .await;
    market
        .inject(InjectedFailure::Transport(TransportError::Lost(
            "reset by peer".to_string(),
        )))
        .await;

    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();

    assert_eq!(task.id, TaskId::from("T1"));
    assert_eq!(market.request_count(Operation::SubmitTask).await, 3);
    assert_eq!(market.task_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let (market, client) = setup_with(&config().max_retries(2));
    for _ in 0..3 {
        market
            .inject(InjectedFailure::status(ResponseStatus::Retryable))
            .await;
    }

    let err = client.submit_task(&sum_spec(), "key-1").await.unwrap_err();

    assert!(matches!(err, ApiError::Retryable { attempts: 3, .. }), "{err:?}");
    assert_eq!(market.request_count(Operation::SubmitTask).await, 3);
    assert_eq!(market.task_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_is_honoured() {
    let (market, client) = setup();
    market
        .inject(InjectedFailure::Status {
            status: ResponseStatus::Retryable,
            retry_after: Some(Duration::from_secs(2)),
        })
        .await;

    let started = Instant::now();
    client.submit_task(&sum_spec(), "key-1").await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(market.request_count(Operation::SubmitTask).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_not_retried() {
    let (market, client) = setup();
    market.inject(InjectedFailure::status(ResponseStatus::Auth)).await;

    let err = client.submit_task(&sum_spec(), "key-1").await.unwrap_err();

    assert!(matches!(err, ApiError::Auth { .. }), "{err:?}");
    assert_eq!(err.status(), Some(ResponseStatus::Auth));
    assert_eq!(market.request_count(Operation::SubmitTask).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_key_is_an_auth_error() {
    init_tracing();
    let market = MockMarketplace::new(Credential::generate().public_key());
    let client = RequestClient::new(
        Arc::new(market.clone()),
        Signer::new(Credential::generate()),
        &config(),
    );

    let err = client.submit_task(&sum_spec(), "key-1").await.unwrap_err();

    assert!(matches!(err, ApiError::Auth { .. }), "{err:?}");
    assert_eq!(market.request_count(Operation::SubmitTask).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_validation_failure_not_retried() {
    let (market, client) = setup();

    let err = client
        .get_task_status(&TaskId::from("T404"))
        .await
        .unwrap_err();

    assert!(
        matches!(err, ApiError::Validation { ref code, .. } if code == "not_found"),
        "{err:?}"
    );
    assert_eq!(market.request_count(Operation::GetTaskStatus).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_payload_never_sent() {
    let (market, client) = setup();

    let err = client
        .call(Operation::SubmitTask, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation { .. }), "{err:?}");

    let err = client
        .submit_task(&TaskSpec::new(serde_json::Value::Null), "key-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation { .. }), "{err:?}");

    assert_eq!(market.request_count(Operation::SubmitTask).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_idempotent_submit_returns_same_task() {
    let (market, client) = setup();

    let first = client.submit_task(&sum_spec(), "same-key").await.unwrap();
    let second = client.submit_task(&sum_spec(), "same-key").await.unwrap();
    let other = client.submit_task(&sum_spec(), "other-key").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_ne!(first.id, other.id);
    assert_eq!(market.task_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_request_times_out() {
    let config = config()
        .max_retries(0)
        .request_timeout(Duration::from_secs(2));
    let (market, client) = setup_with(&config);
    market.inject(InjectedFailure::Stall).await;

    let started = Instant::now();
    let err = client.submit_task(&sum_spec(), "key-1").await.unwrap_err();

    assert!(
        matches!(err, ApiError::Timeout { duration } if duration == Duration::from_secs(2)),
        "{err:?}"
    );
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_attempt_is_retried() {
    let (market, client) = setup_with(&config().request_timeout(Duration::from_secs(1)));
    market.inject(InjectedFailure::Stall).await;

    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();

    assert_eq!(task.state, TaskState::Pending);
    assert_eq!(market.request_count(Operation::SubmitTask).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_replayed_request_refused() {
    let (market, client) = setup();
    let payload = serde_json::to_vec(&SubmitTaskRequest {
        idempotency_key: "key-1".to_string(),
        spec: sum_spec(),
    })
    .unwrap();
    let signed = client.signer().sign(&payload);

    let first = client.send_signed(Operation::SubmitTask, &signed).await;
    let replay = client.send_signed(Operation::SubmitTask, &signed).await;

    tokio_test::assert_ok!(first);
    assert!(matches!(replay, Err(ApiError::Auth { .. })), "{replay:?}");
    assert_eq!(market.request_count(Operation::SubmitTask).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_moves_task_to_cancelled() {
    let (market, client) = setup();
    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();

    let cancelled = client.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.state, TaskState::Cancelled);

    // Cancelling a finished task changes nothing.
    let again = client.cancel_task(&task.id).await.unwrap();
    assert_eq!(again, cancelled);
    assert_eq!(market.task(&task.id).await.unwrap().cursor, 1);
}

#[tokio::test(start_paused = true)]
async fn test_protocol_error_not_retried() {
    let (market, client) = setup();
    market
        .inject(InjectedFailure::Transport(TransportError::Protocol(
            "malformed response".to_string(),
        )))
        .await;

    let started = Instant::now();
    let err = client.submit_task(&sum_spec(), "key-1").await.unwrap_err();

    assert!(
        matches!(err, ApiError::Transport(TransportError::Protocol(_))),
        "{err:?}"
    );
    assert_eq!(market.request_count(Operation::SubmitTask).await, 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(market.task_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unencodable_key_id_fails_without_retry() {
    init_tracing();
    let credential = Credential::from_secret_bytes(&[7u8; 32], Some("bad\nid".into())).unwrap();
    let config = config().max_retries(5);
    let client = RequestClient::over_http(&config, Signer::new(credential)).unwrap();

    let started = Instant::now();
    let err = client.get_task_status(&TaskId::from("T1")).await.unwrap_err();

    assert!(
        matches!(err, ApiError::Transport(TransportError::Protocol(_))),
        "{err:?}"
    );
    // Header encoding fails before any network I/O and before any backoff.
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_claim_submit_and_fetch_work() {
    let (market, client) = setup();
    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();
    assert_eq!(client.get_submission(&task.id).await.unwrap(), None);

    let claim = client.claim_task(&task.id).await.unwrap();
    assert_eq!(claim.task_id, task.id);
    assert_eq!(claim.agent_id, client.signer().key_id());
    assert_eq!(
        client.get_task_status(&task.id).await.unwrap().state,
        TaskState::Running
    );

    // Claiming again is idempotent.
    let again = client.claim_task(&task.id).await.unwrap();
    assert_eq!(again.claimed_at, claim.claimed_at);

    let attachment = Attachment::from_bytes("sum.txt", "text/plain", b"3");
    let submission = client
        .submit_work(&task.id, "3", vec![attachment.clone()])
        .await
        .unwrap();
    assert_eq!(submission.content, "3");
    assert_eq!(submission.attachments, vec![attachment.clone()]);

    let resent = client
        .submit_work(&task.id, "3", vec![attachment])
        .await
        .unwrap();
    assert_eq!(resent.submitted_at, submission.submitted_at);
    assert_eq!(
        client.get_submission(&task.id).await.unwrap(),
        Some(submission)
    );

    let status = client.get_task_status(&task.id).await.unwrap();
    assert_eq!(status.cursor, 2);
    assert_eq!(market.claim(&task.id).await.unwrap().agent_id, claim.agent_id);
}

#[tokio::test(start_paused = true)]
async fn test_claim_by_second_agent_conflicts() {
    init_tracing();
    let seed = [9u8; 32];
    let first = Signer::new(Credential::from_secret_bytes(&seed, Some("agent-a".into())).unwrap());
    let second = Signer::new(Credential::from_secret_bytes(&seed, Some("agent-b".into())).unwrap());
    let market = MockMarketplace::new(first.public_key());
    let client = RequestClient::new(Arc::new(market.clone()), first, &config());
    let rival = RequestClient::new(Arc::new(market.clone()), second, &config());

    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();
    client.claim_task(&task.id).await.unwrap();

    let err = rival.claim_task(&task.id).await.unwrap_err();
    assert!(
        matches!(err, ApiError::Validation { ref code, .. } if code == "conflict"),
        "{err:?}"
    );
    assert_eq!(market.claim(&task.id).await.unwrap().agent_id, "agent-a");
}

#[tokio::test(start_paused = true)]
async fn test_claim_signed_by_another_key_is_refused() {
    let (market, client) = setup();
    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();

    let stranger = RequestClient::new(
        Arc::new(market.clone()),
        Signer::new(Credential::generate()),
        &config(),
    );
    let err = stranger.claim_task(&task.id).await.unwrap_err();
    assert!(matches!(err, ApiError::Auth { .. }), "{err:?}");
    assert!(market.claim(&task.id).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_submit_without_claim_is_rejected() {
    let (_market, client) = setup();
    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();

    let err = client.submit_work(&task.id, "3", Vec::new()).await.unwrap_err();
    assert!(
        matches!(err, ApiError::Validation { ref code, .. } if code == "conflict"),
        "{err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_changed_resubmission_conflicts() {
    let (_market, client) = setup();
    let task = client.submit_task(&sum_spec(), "key-1").await.unwrap();
    client.claim_task(&task.id).await.unwrap();
    client.submit_work(&task.id, "3", Vec::new()).await.unwrap();

    let err = client.submit_work(&task.id, "4", Vec::new()).await.unwrap_err();
    assert!(
        matches!(err, ApiError::Validation { ref code, .. } if code == "conflict"),
        "{err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_attachment_never_sent() {
    let (market, client) = setup();
    let mut attachment = Attachment::from_bytes("sum.txt", "text/plain", b"3");
    attachment.size = 99;

    let err = client
        .submit_work(&TaskId::from("T1"), "3", vec![attachment])
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation { .. }), "{err:?}");
    assert_eq!(market.request_count(Operation::SubmitWork).await, 0);
}
