//! Typed errors for the browser automation boundary
//!
//! Every failure coming out of the automation driver is classified exactly once,
//! here, into an [`ErrorClass`]. The rest of the crate branches on the class and
//! never inspects error message text.

use std::time::Duration;
use thiserror::Error;

/// Failure classes the engine reacts to differently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection refused/reset, DNS failure, proxy tunnel failure
    Connection,
    /// Navigation or wait exceeded its deadline
    Timeout,
    /// HTTP 429 or an explicit "rate limit" response from the proxy or site
    RateLimited,
    /// HTTP 407 from the proxy layer
    ProxyAuth,
    /// 404-class response or aborted navigation
    NotFound,
    /// The URL could not be parsed or was rejected by the browser
    InvalidUrl,
    /// The browser process or its CDP connection is gone
    Disconnected,
    /// The page was torn down underneath the operation (e.g. pool restart)
    PageClosed,
    /// A page script threw or returned something unusable
    Script,
    /// The browser could not be launched at all
    Launch,
    /// Anything else
    Other,
}

/// Error returned by driver operations
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("connection failure navigating to {url}: {message}")]
    Connection { url: String, message: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("rate limited (HTTP {status}) at {url}")]
    RateLimited { url: String, status: u16 },

    #[error("proxy authentication failed (HTTP 407) at {url}")]
    ProxyAuth { url: String },

    #[error("HTTP {status} at {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("navigation aborted for {url}: {message}")]
    Aborted { url: String, message: String },

    #[error("invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("browser disconnected: {0}")]
    Disconnected(String),

    #[error("page closed during operation: {0}")]
    PageClosed(String),

    #[error("page script failed: {0}")]
    Script(String),

    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("driver error: {0}")]
    Other(String),
}

impl DriverError {
    /// Classify this error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. } => ErrorClass::Connection,
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::ProxyAuth { .. } => ErrorClass::ProxyAuth,
            Self::HttpStatus { status, .. } => match status {
                429 => ErrorClass::RateLimited,
                407 => ErrorClass::ProxyAuth,
                _ => ErrorClass::NotFound,
            },
            Self::Aborted { .. } => ErrorClass::NotFound,
            Self::InvalidUrl { .. } => ErrorClass::InvalidUrl,
            Self::Disconnected(_) => ErrorClass::Disconnected,
            Self::PageClosed(_) => ErrorClass::PageClosed,
            Self::Script(_) => ErrorClass::Script,
            Self::Launch(_) => ErrorClass::Launch,
            Self::Other(_) => ErrorClass::Other,
        }
    }

    /// Connection-level failures that feed the circuit breaker
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self.class(), ErrorClass::Connection | ErrorClass::Timeout)
    }

    /// Failures worth retrying after a backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Connection | ErrorClass::Timeout | ErrorClass::RateLimited
        )
    }

    /// Errors caused by our own teardown of the page; not genuine failures
    #[must_use]
    pub fn is_cancellation_artifact(&self) -> bool {
        self.class() == ErrorClass::PageClosed
    }

    /// Only a launch failure aborts a whole run
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Launch
    }

    /// Build an error from an HTTP status observed after navigation.
    ///
    /// Returns `None` for statuses that count as a successful load.
    #[must_use]
    pub fn from_status(url: &str, status: u16) -> Option<Self> {
        match status {
            0 | 200..=399 => None,
            429 => Some(Self::RateLimited {
                url: url.to_string(),
                status,
            }),
            407 => Some(Self::ProxyAuth {
                url: url.to_string(),
            }),
            _ => Some(Self::HttpStatus {
                url: url.to_string(),
                status,
            }),
        }
    }

    /// Classify a raw driver message produced while navigating to `url`.
    ///
    /// This is the single place where message text is interpreted.
    #[must_use]
    pub fn from_message(url: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let url = url.to_string();

        if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
            return Self::RateLimited { url, status: 429 };
        }
        if lower.contains("407") || lower.contains("proxy authentication") {
            return Self::ProxyAuth { url };
        }
        if lower.contains("target closed")
            || lower.contains("session closed")
            || lower.contains("no target with given id")
            || lower.contains("page has been closed")
            || lower.contains("execution context was destroyed")
        {
            return Self::PageClosed(message);
        }
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("err_timed_out") {
            return Self::Timeout {
                operation: format!("navigation to {url}"),
                timeout: Duration::ZERO,
            };
        }
        if lower.contains("err_connection")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("err_name_not_resolved")
            || lower.contains("dns")
            || lower.contains("err_tunnel_connection_failed")
            || lower.contains("err_proxy_connection_failed")
            || lower.contains("err_internet_disconnected")
            || lower.contains("err_address_unreachable")
        {
            return Self::Connection { url, message };
        }
        if lower.contains("err_invalid_url") || lower.contains("relative url without a base") || lower.contains("invalid url") {
            return Self::InvalidUrl { url, message };
        }
        if lower.contains("err_aborted") || lower.contains("err_file_not_found") || lower.contains("404") {
            return Self::Aborted { url, message };
        }
        if lower.contains("channel closed")
            || lower.contains("websocket")
            || lower.contains("browser closed")
            || lower.contains("connection closed")
            || lower.contains("receiver is gone")
        {
            return Self::Disconnected(message);
        }
        Self::Other(message)
    }
}

/// Convenience alias for driver results
pub type DriverResult<T> = Result<T, DriverError>;
