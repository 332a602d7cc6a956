//! Rejoin tuning

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs for the rejoin procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinConfig {
    /// Backoff before every retry
    pub retry_interval: Duration,

    /// Upper bound on a single status or awaiting round
    pub request_timeout: Duration,

    /// Consecutive retries after which every retry is reported as stuck
    pub stuck_retry_threshold: u32,
}

impl Default for RejoinConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            stuck_retry_threshold: 30,
        }
    }
}

impl RejoinConfig {
    /// Set the retry backoff
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Set the per-round timeout
    #[must_use]
    pub const fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Set the stuck-retry threshold
    #[must_use]
    pub const fn with_stuck_retry_threshold(mut self, threshold: u32) -> Self {
        self.stuck_retry_threshold = threshold;
        self
    }
}
