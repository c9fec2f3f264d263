//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote sync API.
    pub endpoint: String,
    /// Interval of the automatic sync timer.
    pub sync_interval: Duration,
    /// Polling of deferred jobs.
    pub poll: PollConfig,
    /// Backoff after failed cycles.
    pub backoff: BackoffConfig,
    /// Maximum number of items per batch. `None` sends everything pending.
    pub max_batch_size: Option<usize>,
    /// Rejections after which a record is flagged `conflict`.
    ///
    /// `None` keeps rejected records pending indefinitely.
    pub conflict_retry_limit: Option<u32>,
    /// Timeout of a single HTTP request.
    pub request_timeout: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            sync_interval: Duration::from_secs(30),
            poll: PollConfig::default(),
            backoff: BackoffConfig::default(),
            max_batch_size: None,
            conflict_retry_limit: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the automatic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the job polling configuration.
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Caps the number of items per batch.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }

    /// Flags records as `conflict` after this many rejections.
    pub fn with_conflict_retry_limit(mut self, limit: u32) -> Self {
        self.conflict_retry_limit = Some(limit);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Polling of deferred jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay between two status requests.
    pub interval: Duration,
    /// Status requests made before giving up.
    pub max_attempts: u32,
}

impl PollConfig {
    /// Creates a polling configuration.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 30)
    }
}

/// Backoff inserted between automatic cycles after failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub base: Duration,
    /// Ceiling for the delay.
    pub max: Duration,
    /// Growth factor per additional failure.
    pub multiplier: f64,
    /// Whether to add up to 25% random jitter to scheduled waits.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Creates a doubling backoff between `base` and `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay after `failures` consecutive failures.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let secs = self.base.as_secs_f64()
            * self
                .multiplier
                .powi(failures.saturating_sub(1).min(i32::MAX as u32) as i32);

        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Applies jitter to a delay when enabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..0.25);
        delay + delay.mul_f64(factor)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}
