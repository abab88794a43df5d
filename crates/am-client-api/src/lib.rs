//! Client API seams for the agent-market client
//!
//! [`TaskApi`] is the request/response surface the task session drives.
//! [`RequestTransport`], [`StreamConnector`] and [`StreamTransport`] are the
//! collaborator interfaces the transport layer provides; the HTTP/SSE
//! implementations live in `am-rest-client` and the in-memory ones in
//! `am-rest-client-mock`.

mod error;
mod transport;

pub use error::*;
pub use transport::*;

use am_api_contract::*;
use async_trait::async_trait;

#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Submit a task. Retried calls with the same idempotency key return
    /// the task created by the first one.
    async fn submit_task(&self, spec: &TaskSpec, idempotency_key: &str) -> ApiResult<Task>;

    async fn get_task_status(&self, task_id: &TaskId) -> ApiResult<Task>;

    async fn cancel_task(&self, task_id: &TaskId) -> ApiResult<Task>;
}
