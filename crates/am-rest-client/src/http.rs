//! HTTP request transport

use std::time::Duration;

use am_api_contract::ResponseStatus;
use am_client_api::{ApiRequest, RawResponse, RequestTransport, TransportError, TransportResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use url::Url;

use crate::auth::apply_to_headers;
use crate::config::{endpoint, ClientConfig};
use crate::error::ConfigError;

/// Posts signed operation payloads to the marketplace REST API
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let http_client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn call(&self, request: ApiRequest) -> TransportResult<RawResponse> {
        let url = endpoint(&self.base_url, request.operation.path())
            .map_err(|e| TransportError::Protocol(format!("bad request URL: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        apply_to_headers(request.operation, &request.auth, &mut headers)?;

        let response = self
            .http_client
            .post(url)
            .headers(headers)
            .body(request.payload)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = ResponseStatus::from_http(response.status().as_u16());
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Only the delta-seconds form is honored; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Lost(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 10 "), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_operation_urls() {
        let config = ClientConfig::from_url("http://localhost:3001/v1").unwrap();
        let transport = HttpTransport::new(&config).unwrap();
        let url = endpoint(
            transport.base_url(),
            am_api_contract::Operation::CancelTask.path(),
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://localhost:3001/v1/tasks/cancel");

        let url = endpoint(
            transport.base_url(),
            am_api_contract::Operation::ClaimTask.path(),
        )
        .unwrap();
        assert_eq!(url.as_str(), "http://localhost:3001/v1/tasks/claim");
    }
}
