//! Exponential backoff with jitter.
//!
//! Used both by the request retry loop and by the event stream's reconnect
//! loop. Delays grow as `base * 2^attempt`, are jittered by up to
//! `±jitter` of the nominal value, never shrink from one attempt to the
//! next, and are capped at `max`.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Nominal delay before the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Relative jitter in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base.is_zero() {
            return Err("backoff base must be > 0".to_string());
        }
        if self.max < self.base {
            return Err("backoff max must be >= base".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("backoff jitter must be in [0, 1)".to_string());
        }
        Ok(())
    }

    /// Un-jittered delay for a zero-based attempt, capped at `max`.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(63) as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Inclusive range a jittered delay for `attempt` falls into, before the
    /// non-decreasing adjustment.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let nominal = self.nominal(attempt).as_secs_f64();
        let low = nominal * (1.0 - self.jitter);
        let high = (nominal * (1.0 + self.jitter)).min(self.max.as_secs_f64());
        (Duration::from_secs_f64(low), Duration::from_secs_f64(high))
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let (low, high) = self.bounds(attempt);
        if high <= low {
            return low;
        }
        let secs = rand::thread_rng().gen_range(low.as_secs_f64()..=high.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Stateful delay generator for one retry or reconnect sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_at_least(None)
    }

    /// Next delay, raised to `floor` when the server asked for a longer
    /// wait. The result is still capped at `max`.
    pub fn next_delay_at_least(&mut self, floor: Option<Duration>) -> Duration {
        let mut delay = self.config.jittered(self.attempt).max(self.last);
        if let Some(floor) = floor {
            delay = delay.max(floor);
        }
        delay = delay.min(self.config.max);

        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
