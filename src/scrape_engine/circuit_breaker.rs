//! Circuit breaker for connection-level failures
//!
//! Tracks consecutive connection failures (refused, timeout, DNS, proxy tunnel)
//! per channel, where a channel is the host the proxy session talks to.
//!
//! - Closed: normal operation
//! - Open: too many consecutive failures; requests are skipped until the
//!   cool-down elapses, after which single probe requests are let through
//!
//! Any success closes the circuit and resets the failure count.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
}

/// Health tracking for a single channel
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub status: CircuitStatus,
    /// Consecutive failures without an intervening success
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    /// When the circuit last transitioned to Open
    pub opened_at: Option<Instant>,
    pub last_success: Option<Instant>,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            opened_at: None,
            last_success: None,
        }
    }
}

/// Per-channel circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    channels: DashMap<String, CircuitState>,
    failure_threshold: u32,
    open_cooldown: Duration,
}

impl CircuitBreaker {
    /// # Arguments
    /// * `failure_threshold` - Open after this many consecutive failures
    /// * `open_cooldown` - How long an open circuit rejects requests before allowing a probe
    #[must_use]
    pub fn new(failure_threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            channels: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            open_cooldown,
        }
    }

    /// Whether a request on `channel` should be attempted
    pub fn should_attempt(&self, channel: &str) -> bool {
        let Some(state) = self.channels.get(channel) else {
            return true;
        };
        match state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => match state.opened_at {
                Some(opened) if opened.elapsed() >= self.open_cooldown => {
                    debug!("Circuit for {channel} open for {:?}, allowing probe", opened.elapsed());
                    true
                }
                _ => false,
            },
        }
    }

    /// Record a successful navigation; always closes the circuit
    pub fn on_success(&self, channel: &str) {
        let mut state = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(CircuitState::new);

        if state.status == CircuitStatus::Open {
            info!(
                "Circuit breaker CLOSED for {channel} after {} consecutive failures",
                state.consecutive_failures
            );
        }
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.total_successes += 1;
        state.last_success = Some(Instant::now());
    }

    /// Record a connection-level failure.
    ///
    /// Returns the status after the failure so callers can react to the
    /// transition to Open.
    pub fn on_failure(&self, channel: &str, error: &str) -> CircuitStatus {
        let mut state = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(CircuitState::new);

        state.consecutive_failures += 1;
        state.total_failures += 1;

        if state.consecutive_failures >= self.failure_threshold {
            if state.status != CircuitStatus::Open {
                warn!(
                    "Circuit breaker OPEN for {} after {} consecutive failures. Last error: {}",
                    channel, state.consecutive_failures, error
                );
            }
            // A failed probe restarts the cool-down
            state.status = CircuitStatus::Open;
            state.opened_at = Some(Instant::now());
        } else {
            debug!(
                "Circuit breaker failure for {} ({}/{}): {}",
                channel, state.consecutive_failures, self.failure_threshold, error
            );
        }
        state.status
    }

    /// Snapshot of a channel, `None` if never seen
    #[must_use]
    pub fn state(&self, channel: &str) -> Option<CircuitState> {
        self.channels.get(channel).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn is_open(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|s| s.status == CircuitStatus::Open)
    }

    /// Channels currently open
    #[must_use]
    pub fn open_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|entry| entry.value().status == CircuitStatus::Open)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Extract the host used as a breaker channel
///
/// # Arguments
/// * `url_str` - The URL string to parse
pub fn extract_domain(url_str: &str) -> Result<String, String> {
    match url::Url::parse(url_str) {
        Ok(url) => {
            if let Some(host) = url.host_str() {
                Ok(host.to_string())
            } else {
                Err(format!("URL has no host: {url_str}"))
            }
        }
        Err(e) => Err(format!("Failed to parse URL {url_str}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_channel_is_closed() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(cb.should_attempt("example.com"));
        assert!(cb.state("example.com").is_none());
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));

        assert_eq!(cb.on_failure("example.com", "refused"), CircuitStatus::Closed);
        assert_eq!(cb.on_failure("example.com", "refused"), CircuitStatus::Closed);
        assert!(cb.should_attempt("example.com"));
        assert_eq!(cb.on_failure("example.com", "refused"), CircuitStatus::Open);

        let state = cb.state("example.com").unwrap();
        assert_eq!(state.consecutive_failures, 3);
        assert!(!cb.should_attempt("example.com"));
        assert_eq!(cb.open_channels(), vec!["example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_single_success_resets() {
        let cb = CircuitBreaker::new(2, Duration::from_secs(60));
        for _ in 0..7 {
            cb.on_failure("example.com", "timeout");
        }
        assert!(cb.is_open("example.com"));

        cb.on_success("example.com");
        let state = cb.state("example.com").unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(cb.should_attempt("example.com"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_allowed_after_cooldown() {
        let cb = CircuitBreaker::new(1, Duration::from_secs(30));
        cb.on_failure("example.com", "dns");
        assert!(!cb.should_attempt("example.com"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cb.should_attempt("example.com"));
        // Still open until a success arrives
        assert!(cb.is_open("example.com"));
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://www.example.com/org/abc/competitions").unwrap(),
            "www.example.com"
        );
        assert!(extract_domain("not a url").is_err());
    }
}
