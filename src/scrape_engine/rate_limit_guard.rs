//! Exponential backoff for rate-limited proxy sessions
//!
//! Every HTTP 429 (or "rate limit" response) pushes the backoff window out to
//! `now + min(2^n, 60)` minutes, where `n` is the number of consecutive
//! rate-limit signals. The first success clears the state. Proxy
//! authentication failures (407) are reported separately and never touch the
//! rate-limit counter.

use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Cap on the backoff window in minutes
pub const MAX_BACKOFF_MINUTES: u64 = 60;

/// Backoff in whole minutes for `consecutive` rate-limit errors: `min(2^n, 60)`
#[must_use]
pub fn backoff_minutes(consecutive: u32) -> u64 {
    if consecutive >= 6 {
        return MAX_BACKOFF_MINUTES;
    }
    (1u64 << consecutive).min(MAX_BACKOFF_MINUTES)
}

/// Backoff window for `consecutive` rate-limit errors
#[must_use]
pub fn backoff_duration(consecutive: u32) -> Duration {
    Duration::from_secs(backoff_minutes(consecutive) * 60)
}

/// Snapshot of the guard's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitState {
    pub consecutive_rate_limit_errors: u32,
    pub backoff_until: Option<Instant>,
    pub proxy_auth_failures: u64,
}

/// Shared rate-limit state for one proxy channel
#[derive(Debug, Default)]
pub struct RateLimitGuard {
    state: parking_lot::Mutex<RateLimitState>,
}

impl RateLimitGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rate-limit signal and return the new backoff window
    pub fn on_rate_limited(&self, context: &str) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_rate_limit_errors = state.consecutive_rate_limit_errors.saturating_add(1);
        let window = backoff_duration(state.consecutive_rate_limit_errors);
        state.backoff_until = Some(Instant::now() + window);
        warn!(
            "Rate limited ({context}); consecutive={}, backing off {} minutes",
            state.consecutive_rate_limit_errors,
            window.as_secs() / 60
        );
        window
    }

    /// Record a proxy authentication failure (HTTP 407)
    pub fn on_proxy_auth_failure(&self, context: &str) {
        let mut state = self.state.lock();
        state.proxy_auth_failures += 1;
        error!(
            "Proxy authentication failed ({context}); total={} - check proxy credentials",
            state.proxy_auth_failures
        );
    }

    /// Clear both the counter and the window; called on every successful navigation
    pub fn reset_rate_limit_state(&self) {
        let mut state = self.state.lock();
        if state.consecutive_rate_limit_errors > 0 || state.backoff_until.is_some() {
            info!(
                "Rate limit state cleared after {} consecutive errors",
                state.consecutive_rate_limit_errors
            );
        }
        state.consecutive_rate_limit_errors = 0;
        state.backoff_until = None;
    }

    /// Remaining backoff, `None` when requests may proceed
    #[must_use]
    pub fn remaining_backoff(&self) -> Option<Duration> {
        let state = self.state.lock();
        let until = state.backoff_until?;
        let now = Instant::now();
        (until > now).then(|| until - now)
    }

    #[must_use]
    pub fn is_in_backoff(&self) -> bool {
        self.remaining_backoff().is_some()
    }

    /// Sleep out the remaining window. Only the calling task waits.
    ///
    /// Returns how long the task slept.
    pub async fn wait_for_backoff(&self) -> Duration {
        let Some(remaining) = self.remaining_backoff() else {
            return Duration::ZERO;
        };
        debug!("Waiting {:?} for rate-limit backoff", remaining);
        tokio::time::sleep(remaining).await;
        remaining
    }

    #[must_use]
    pub fn state(&self) -> RateLimitState {
        *self.state.lock()
    }
}
