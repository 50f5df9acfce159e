//! Bounded polling for state that appears some time after an action, such as
//! the address a container is assigned once its network comes up.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ErrorKind, LxdError, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_IPV4_ATTEMPTS: u32 = 15;
pub const DEFAULT_IPV6_ATTEMPTS: u32 = 10;

/// Fixed-interval retry with an attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Total number of checks, including the first
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn ipv4() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_IPV4_ATTEMPTS)
    }

    pub fn ipv6() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_IPV6_ATTEMPTS)
    }

    /// Run `check` until it yields a value.
    ///
    /// `check` receives the 1-based attempt number. `Ok(None)` and recoverable
    /// errors both count as a failed attempt; protocol violations abort at once.
    /// Checks are spaced by `interval`, with no sleep after the last one.
    ///
    /// # Errors
    /// `RetriesExceeded` after `max_attempts` failed checks.
    pub async fn poll_until<T, F, Fut>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            match check(attempt).await {
                Ok(Some(value)) => {
                    trace!(what, attempt, "Poll satisfied");
                    return Ok(value);
                }
                Ok(None) => trace!(what, attempt, "Poll not yet satisfied"),
                Err(e) if e.kind() == ErrorKind::Protocol => return Err(e),
                Err(e) => debug!(what, attempt, error = %e, "Poll check failed"),
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(LxdError::RetriesExceeded {
            what: what.to_string(),
            attempts: self.max_attempts,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ipv4()
    }
}
