//! Shared default values
//!
//! Defaults used by the config builder and by components constructed without
//! a config, kept in one place so the two never drift apart.

/// Default number of permanent pages in the pool
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default navigation timeout: 45 seconds
///
/// The target site is slow behind the proxy; shorter values produce
/// spurious connection-class failures that feed the circuit breaker.
pub const DEFAULT_NAVIGATION_TIMEOUT_SECS: u64 = 45;

/// Per-stage concurrency defaults
pub const DEFAULT_COMPETITIONS_CONCURRENCY: usize = 2;
pub const DEFAULT_TEAMS_CONCURRENCY: usize = 3;
pub const DEFAULT_GAMES_CONCURRENCY: usize = 3;
pub const DEFAULT_VALIDATION_CONCURRENCY: usize = 4;
pub const DEFAULT_CLEANUP_CONCURRENCY: usize = 2;

/// Restart the browser after this many completed tasks
pub const DEFAULT_MAX_OPERATIONS_BEFORE_RESTART: u64 = 500;

/// Operation-count restarts are spaced at least this far apart: 5 minutes
pub const DEFAULT_MIN_RESTART_INTERVAL_SECS: u64 = 300;

/// Consecutive connection failures before a channel's circuit opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// How long an open circuit rejects requests before letting a probe through
pub const DEFAULT_CIRCUIT_COOLDOWN_SECS: u64 = 300;

/// Interval between orphaned-page sweeps: 2 minutes
pub const DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS: u64 = 120;

/// Profile directories older than this are treated as leftovers of crashed runs
pub const STALE_PROFILE_MIN_AGE_SECS: u64 = 3600;

pub const DEFAULT_POLLING_PRESET: &str = "balanced";

/// Resource type under which run progress is stored
pub const PROGRESS_RESOURCE_TYPE: &str = "sync-progress";

/// Chrome user agent string for stealth mode
///
/// Chrome releases new stable versions ~every 4 weeks.
/// Update quarterly to stay within reasonable version window.
///
/// Reference: https://chromiumdash.appspot.com/schedule
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.6834.160 Safari/537.36";
