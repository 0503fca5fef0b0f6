//! Resilient execution of browser-driven extraction
//!
//! - [`ParallelTaskRunner`]: bounded-concurrency batches with per-task isolation
//! - [`CircuitBreaker`] and [`RateLimitGuard`]: proxy failure handling, joined by [`ProxyHealth`]
//! - [`AdaptivePollingDetector`]: waits for client-rendered content
//! - [`StructureChangeMonitor`]: flags markup drift against a per-run baseline

pub mod cancellation;
pub mod circuit_breaker;
pub mod page_timeout;
pub mod polling;
pub mod proxy_health;
pub mod rate_limit_guard;
pub mod structure_monitor;
pub mod task_runner;

pub use cancellation::CancellationSignal;
pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus, extract_domain};
pub use page_timeout::with_timeout;
pub use polling::{
    AdaptivePollingDetector, ContentProbe, Observation, PollOutcome, PollingMetricsSnapshot,
    PollingStrategy, ProbeError,
};
pub use proxy_health::{CircuitOpen, ErrorDisposition, ProxyHealth};
pub use rate_limit_guard::{RateLimitGuard, RateLimitState, backoff_duration, backoff_minutes};
pub use structure_monitor::{
    CriticalSelector, ElementSnapshot, PageMetadata, Severity, StructureChange,
    StructureChangeMonitor, StructureSnapshot, diff_snapshots,
};
pub use task_runner::{
    BatchAborted, BatchOutcome, BatchSummary, ParallelTaskRunner, RunOptions, TaskError, TaskResult,
};
