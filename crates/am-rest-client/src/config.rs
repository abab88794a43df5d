//! Client configuration
//!
//! Defaults can be overridden programmatically through the chained setters
//! or from the environment with [`ClientConfig::from_env`].

use std::time::Duration;

use url::Url;

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.agent-marketplace.com/v1";

pub const API_URL_ENV: &str = "AGENT_MARKET_API_URL";
pub const REQUEST_TIMEOUT_ENV: &str = "AGENT_MARKET_REQUEST_TIMEOUT_MS";
pub const MAX_RETRIES_ENV: &str = "AGENT_MARKET_MAX_RETRIES";
pub const HEARTBEAT_TIMEOUT_ENV: &str = "AGENT_MARKET_HEARTBEAT_TIMEOUT_MS";

/// Retry budget for request/response calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Event stream timing and buffering
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Longest allowed silence on a subscribed connection.
    pub heartbeat_timeout: Duration,
    /// Time allowed for connect plus subscription acknowledgement.
    pub handshake_timeout: Duration,
    pub reconnect: BackoffConfig,
    /// A connection that stays up this long resets the reconnect attempt
    /// counter.
    pub stability_threshold: Duration,
    /// Give up reconnecting after this much continuous downtime. `None`
    /// retries forever.
    pub max_downtime: Option<Duration>,
    /// Capacity of each task's event channel. Up to as many again are
    /// queued behind a full channel before the task falls back to replay.
    pub event_buffer: usize,
    /// Time `close` waits for consumers to finish reading buffered events.
    pub drain_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            reconnect: BackoffConfig::default(),
            stability_threshold: Duration::from_secs(60),
            max_downtime: None,
            event_buffer: 256,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl StreamConfig {
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = backoff;
        self
    }

    pub fn stability_threshold(mut self, threshold: Duration) -> Self {
        self.stability_threshold = threshold;
        self
    }

    pub fn max_downtime(mut self, downtime: Option<Duration>) -> Self {
        self.max_downtime = downtime;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::invalid("heartbeat_timeout must be > 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::invalid("handshake_timeout must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::invalid("event_buffer must be > 0"));
        }
        if self.max_downtime.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid("max_downtime must be > 0 when set"));
        }
        self.reconnect
            .validate()
            .map_err(|e| ConfigError::invalid(format!("reconnect: {e}")))
    }
}

/// Resolve an API path against the base URL, keeping any path prefix the
/// base carries whether or not it ends in `/`.
pub fn endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(path.trim_start_matches('/'))
}

/// Configuration shared by the request client, the event stream and the
/// task session
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// API root, including its version prefix. Operation paths are resolved
    /// with [`endpoint`].
    pub base_url: Url,
    /// Per-attempt request timeout.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub stream: StreamConfig,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            stream: StreamConfig::default(),
            user_agent: format!("am-rest-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn from_url(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(Url::parse(base_url)?))
    }

    /// Build a configuration from `AGENT_MARKET_*` environment variables,
    /// falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = lookup(API_URL_ENV).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::from_url(&base_url)?;

        if let Some(ms) = parse_var::<u64>(&lookup, REQUEST_TIMEOUT_ENV)? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, MAX_RETRIES_ENV)? {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, HEARTBEAT_TIMEOUT_ENV)? {
            config.stream.heartbeat_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(format!(
                "base_url must be http or https, got {}",
                self.base_url.scheme()
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout must be > 0"));
        }
        self.retry
            .backoff
            .validate()
            .map_err(|e| ConfigError::invalid(format!("retry: {e}")))?;
        self.stream.validate()
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Env {
                var,
                message: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_url(DEFAULT_BASE_URL).unwrap();
        assert_eq!(config.base_url.as_str(), "https://api.agent-marketplace.com/v1");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            (API_URL_ENV, "http://localhost:8080"),
            (REQUEST_TIMEOUT_ENV, "1500"),
            (MAX_RETRIES_ENV, "0"),
            (HEARTBEAT_TIMEOUT_ENV, "2000"),
        ]))
        .unwrap();

        assert_eq!(config.base_url.as_str(), "http://localhost:8080/");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.stream.heartbeat_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_env_bad_number() {
        let err = ClientConfig::from_lookup(lookup(&[(MAX_RETRIES_ENV, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var, .. } if var == MAX_RETRIES_ENV));
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let config = ClientConfig::from_url(DEFAULT_BASE_URL)
            .unwrap()
            .stream(StreamConfig::default().event_buffer(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        for base in ["http://localhost:3001/v1", "http://localhost:3001/v1/"] {
            let base = Url::parse(base).unwrap();
            assert_eq!(
                endpoint(&base, "tasks/cancel").unwrap().as_str(),
                "http://localhost:3001/v1/tasks/cancel"
            );
        }
        let root = Url::parse("http://localhost:3001").unwrap();
        assert_eq!(
            endpoint(&root, "/tasks").unwrap().as_str(),
            "http://localhost:3001/tasks"
        );
    }

    #[test]
    fn test_validate_rejects_non_http_scheme() {
        let config = ClientConfig::from_url("ftp://example.com").unwrap();
        assert!(config.validate().is_err());
    }
}
