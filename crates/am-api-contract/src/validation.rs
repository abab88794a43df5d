//! Validation helpers for API contract types

use crate::error::ApiContractError;
use crate::types::*;
use validator::{Validate, ValidationError, ValidationErrors};

/// Validate a task submission request
pub fn validate_submit_request(request: &SubmitTaskRequest) -> Result<(), ApiContractError> {
    request.validate()?;
    validate_task_spec(&request.spec).map_err(|e| {
        let mut errors = ValidationErrors::new();
        errors.add("spec", e);
        ApiContractError::Validation(errors)
    })?;
    Ok(())
}

/// A task spec must carry some description; `null` is rejected.
pub fn validate_task_spec(spec: &TaskSpec) -> Result<(), ValidationError> {
    if spec.is_null() {
        let mut error = ValidationError::new("empty_spec");
        error.message = Some("Task spec cannot be null".into());
        return Err(error);
    }
    Ok(())
}

/// Validate a task identifier before it is sent anywhere
pub fn validate_task_id(task_id: &TaskId) -> Result<(), ApiContractError> {
    let id = task_id.as_str();
    if id.is_empty() || id.len() > 256 || id.chars().any(char::is_control) {
        return Err(ApiContractError::InvalidSubscription(format!(
            "invalid task id {id:?}"
        )));
    }
    Ok(())
}

/// Validate a subscription handshake request
pub fn validate_subscribe_request(request: &SubscribeRequest) -> Result<(), ApiContractError> {
    if request.task_ids.is_empty() {
        return Err(ApiContractError::InvalidSubscription(
            "subscription names no tasks".to_string(),
        ));
    }

    for task_id in &request.task_ids {
        validate_task_id(task_id)?;
        if !request.resume_cursors.contains_key(task_id) {
            return Err(ApiContractError::InvalidSubscription(format!(
                "missing resume cursor for task {task_id}"
            )));
        }
    }

    Ok(())
}

/// Validate a claim before it is signed
pub fn validate_claim_request(request: &ClaimTaskRequest) -> Result<(), ApiContractError> {
    validate_task_id(&request.task_id)?;
    request.validate()?;
    Ok(())
}

/// Validate a work submission, including that every attachment decodes to
/// its declared size
pub fn validate_submit_work(request: &SubmitWorkRequest) -> Result<(), ApiContractError> {
    validate_task_id(&request.task_id)?;
    request.validate()?;

    for attachment in &request.attachments {
        let decoded = attachment.decode()?;
        if decoded.len() as u64 != attachment.size {
            return Err(ApiContractError::InvalidAttachment(format!(
                "{}: declared {} bytes, content has {}",
                attachment.name,
                attachment.size,
                decoded.len()
            )));
        }
    }
    Ok(())
}

/// Reject empty payloads for operations that change task state
pub fn validate_payload(operation: Operation, payload: &[u8]) -> Result<(), ApiContractError> {
    if operation.is_mutating() && payload.is_empty() {
        return Err(ApiContractError::EmptyPayload(operation));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_validate_submit_request_valid() {
        let request = SubmitTaskRequest {
            idempotency_key: "key-1".to_string(),
            spec: TaskSpec::new(serde_json::json!({"op": "sum", "args": [1, 2]})),
        };

        assert!(validate_submit_request(&request).is_ok());
    }

    #[test]
    fn test_validate_submit_request_empty_key() {
        let request = SubmitTaskRequest {
            idempotency_key: "".to_string(), // Invalid: empty key
            spec: TaskSpec::new(serde_json::json!({"op": "sum"})),
        };

        assert!(validate_submit_request(&request).is_err());
    }

    #[test]
    fn test_validate_submit_request_null_spec() {
        let request = SubmitTaskRequest {
            idempotency_key: "key-1".to_string(),
            spec: TaskSpec::new(serde_json::Value::Null),
        };

        assert!(matches!(
            validate_submit_request(&request),
            Err(ApiContractError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_subscribe_request_missing_cursor() {
        let request = SubscribeRequest {
            task_ids: vec!["T1".into(), "T2".into()],
            resume_cursors: BTreeMap::from([(TaskId::from("T1"), 0)]),
        };

        assert!(validate_subscribe_request(&request).is_err());
    }

    fn submit_work(attachments: Vec<Attachment>) -> SubmitWorkRequest {
        SubmitWorkRequest {
            task_id: "T1".into(),
            agent_id: "agent-1".to_string(),
            content: "3".to_string(),
            attachments,
        }
    }

    #[test]
    fn test_validate_submit_work() {
        let attachment = Attachment::from_bytes("sum.txt", "text/plain", b"3");
        assert!(validate_submit_work(&submit_work(vec![attachment])).is_ok());

        let mut empty = submit_work(Vec::new());
        empty.content.clear();
        assert!(matches!(
            validate_submit_work(&empty),
            Err(ApiContractError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_submit_work_attachment_size_mismatch() {
        let mut attachment = Attachment::from_bytes("sum.txt", "text/plain", b"3");
        attachment.size = 10;
        assert!(matches!(
            validate_submit_work(&submit_work(vec![attachment])),
            Err(ApiContractError::InvalidAttachment(_))
        ));

        let mut garbled = Attachment::from_bytes("sum.txt", "text/plain", b"3");
        garbled.content = "***".to_string();
        assert!(validate_submit_work(&submit_work(vec![garbled])).is_err());
    }

    #[test]
    fn test_validate_claim_request() {
        let claim = ClaimTaskRequest {
            task_id: "T1".into(),
            agent_id: String::new(),
        };
        assert!(validate_claim_request(&claim).is_err());
    }

    #[test]
    fn test_validate_payload_mutating() {
        assert!(validate_payload(Operation::SubmitTask, b"").is_err());
        assert!(validate_payload(Operation::CancelTask, b"").is_err());
        assert!(validate_payload(Operation::GetTaskStatus, b"").is_ok());
        assert!(validate_payload(Operation::SubmitWork, b"").is_err());
        assert!(validate_payload(Operation::SubmitTask, b"{}").is_ok());
    }
}
