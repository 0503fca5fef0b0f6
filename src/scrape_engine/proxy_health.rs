//! Routes navigation outcomes to the circuit breaker and rate-limit guard

use std::time::Duration;
use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitStatus};
use super::rate_limit_guard::RateLimitGuard;
use crate::browser_pool::PageLease;
use crate::driver::{DriverError, ErrorClass};

/// What a navigation error means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Backoff window set; the page was marked for eviction
    RateLimited { backoff: Duration },
    /// Proxy credentials rejected; counted separately from rate limits
    ProxyAuth,
    /// Fed to the breaker; `circuit` is the status afterwards
    Connection { circuit: CircuitStatus },
    /// The page was torn down underneath the task
    Artifact,
    /// Give up on this item only
    Abandon,
}

/// Returned by [`ProxyHealth::admit`] while a channel's circuit is open
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {channel}")]
pub struct CircuitOpen {
    pub channel: String,
}

/// Shared failure state for the proxy channels a run talks to
#[derive(Debug)]
pub struct ProxyHealth {
    breaker: CircuitBreaker,
    guard: RateLimitGuard,
}

impl ProxyHealth {
    #[must_use]
    pub fn new(breaker: CircuitBreaker, guard: RateLimitGuard) -> Self {
        Self { breaker, guard }
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn guard(&self) -> &RateLimitGuard {
        &self.guard
    }

    /// Wait out any backoff, then check the breaker.
    ///
    /// Returns how long the caller slept.
    pub async fn admit(&self, channel: &str) -> Result<Duration, CircuitOpen> {
        let slept = self.guard.wait_for_backoff().await;
        if !self.breaker.should_attempt(channel) {
            return Err(CircuitOpen {
                channel: channel.to_string(),
            });
        }
        Ok(slept)
    }

    pub fn on_navigation_success(&self, channel: &str) {
        self.breaker.on_success(channel);
        self.guard.reset_rate_limit_state();
    }

    /// Classify a navigation error and update shared state.
    ///
    /// A rate-limited page is marked on its lease so it is evicted on release.
    pub fn on_navigation_error(
        &self,
        channel: &str,
        error: &DriverError,
        lease: Option<&mut PageLease>,
    ) -> ErrorDisposition {
        match error.class() {
            ErrorClass::RateLimited => {
                let backoff = self.guard.on_rate_limited(channel);
                if let Some(lease) = lease {
                    lease.mark_rate_limited();
                }
                ErrorDisposition::RateLimited { backoff }
            }
            ErrorClass::ProxyAuth => {
                self.guard.on_proxy_auth_failure(channel);
                ErrorDisposition::ProxyAuth
            }
            ErrorClass::Connection | ErrorClass::Timeout => ErrorDisposition::Connection {
                circuit: self.breaker.on_failure(channel, &error.to_string()),
            },
            ErrorClass::PageClosed => {
                debug!("Navigation on {channel} interrupted: {error}");
                ErrorDisposition::Artifact
            }
            ErrorClass::Disconnected => {
                if let Some(lease) = lease {
                    lease.mark_unhealthy();
                }
                ErrorDisposition::Abandon
            }
            _ => ErrorDisposition::Abandon,
        }
    }
}

impl Default for ProxyHealth {
    fn default() -> Self {
        Self::new(
            CircuitBreaker::new(
                crate::utils::constants::DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
                Duration::from_secs(crate::utils::constants::DEFAULT_CIRCUIT_COOLDOWN_SECS),
            ),
            RateLimitGuard::new(),
        )
    }
}
