//! Restart policy and orphan sweeping for the browser process

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::memory::{MemoryProbe, MemorySnapshot, ProcStatusProbe};
use super::{BrowserProcess, PageResourcePool, PoolError};

/// Thresholds that trigger a browser restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_operations: u64,
    /// Operation-count restarts are not taken more often than this
    pub min_restart_interval: Duration,
    pub max_rss_bytes: Option<u64>,
    pub max_heap_bytes: Option<u64>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_operations: crate::utils::constants::DEFAULT_MAX_OPERATIONS_BEFORE_RESTART,
            min_restart_interval: Duration::from_secs(
                crate::utils::constants::DEFAULT_MIN_RESTART_INTERVAL_SECS,
            ),
            max_rss_bytes: None,
            max_heap_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    OperationCount { count: u64 },
    Rss { bytes: u64, limit: u64 },
    Heap { bytes: u64, limit: u64 },
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OperationCount { count } => write!(f, "{count} operations since last restart"),
            Self::Rss { bytes, limit } => write!(f, "RSS {bytes} bytes over limit {limit}"),
            Self::Heap { bytes, limit } => write!(f, "heap {bytes} bytes over limit {limit}"),
        }
    }
}

/// Coordinates restarts of the browser process behind a pool.
///
/// One instance per run, shared by reference with every stage.
#[derive(Debug)]
pub struct BrowserLifecycleManager {
    process: Arc<BrowserProcess>,
    pool: Arc<PageResourcePool>,
    policy: RestartPolicy,
    probe: Box<dyn MemoryProbe>,
    operation_count: AtomicU64,
    restarts: AtomicU64,
    last_restart_at: parking_lot::Mutex<Instant>,
    memory: parking_lot::Mutex<MemorySnapshot>,
    restart_lock: tokio::sync::Mutex<()>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BrowserLifecycleManager {
    #[must_use]
    pub fn new(pool: Arc<PageResourcePool>, policy: RestartPolicy) -> Self {
        Self {
            process: Arc::clone(pool.process()),
            pool,
            policy,
            probe: Box::new(ProcStatusProbe::default()),
            operation_count: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            last_restart_at: parking_lot::Mutex::new(Instant::now()),
            memory: parking_lot::Mutex::new(MemorySnapshot::default()),
            restart_lock: tokio::sync::Mutex::new(()),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<PageResourcePool> {
        &self.pool
    }

    #[must_use]
    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Launch the browser and fill the pool
    pub async fn start(&self) -> Result<usize, PoolError> {
        self.process.launch().await?;
        let opened = self.pool.initialize(self.pool.capacity()).await?;
        *self.last_restart_at.lock() = Instant::now();
        Ok(opened)
    }

    /// Count one completed task; returns the new total
    pub fn record_operation(&self) -> u64 {
        self.operation_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn operation_count(&self) -> u64 {
        self.operation_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_restart_at(&self) -> Instant {
        *self.last_restart_at.lock()
    }

    /// Take a fresh reading of the browser's memory.
    ///
    /// The previous reading is kept when the browser has no known pid or
    /// sampling fails.
    pub async fn refresh_memory(&self) -> MemorySnapshot {
        let sample = match self.process.pid().await {
            Some(pid) => self.probe.sample(pid),
            None => {
                debug!("Browser pid unknown, memory not sampled");
                None
            }
        };
        let mut memory = self.memory.lock();
        if let Some(sample) = sample {
            *memory = sample;
        }
        *memory
    }

    #[must_use]
    pub fn memory(&self) -> MemorySnapshot {
        *self.memory.lock()
    }

    /// First threshold currently exceeded, if any
    #[must_use]
    pub fn restart_reason(&self) -> Option<RestartReason> {
        let count = self.operation_count();
        let since_restart = self.last_restart_at.lock().elapsed();
        if count >= self.policy.max_operations && since_restart >= self.policy.min_restart_interval {
            return Some(RestartReason::OperationCount { count });
        }

        let memory = self.memory();
        if let Some(limit) = self.policy.max_rss_bytes
            && memory.rss_bytes > limit
        {
            return Some(RestartReason::Rss {
                bytes: memory.rss_bytes,
                limit,
            });
        }
        if let Some(limit) = self.policy.max_heap_bytes
            && memory.heap_bytes > limit
        {
            return Some(RestartReason::Heap {
                bytes: memory.heap_bytes,
                limit,
            });
        }
        None
    }

    #[must_use]
    pub fn should_restart(&self) -> bool {
        self.restart_reason().is_some()
    }

    /// Close every pooled page, relaunch the browser and refill the pool at
    /// its original capacity. Returns the new generation.
    ///
    /// Call between stages: leases still outstanding become stale and are
    /// discarded when they come back.
    pub async fn restart(&self) -> Result<u64, PoolError> {
        let _guard = self.restart_lock.lock().await;
        let outstanding = self.pool.outstanding_leases();
        if outstanding > 0 {
            warn!("Restarting browser with {outstanding} leases still outstanding");
        }

        let capacity = self.pool.capacity();
        let generation = self.pool.invalidate_all().await;
        self.process.relaunch().await?;
        self.pool.initialize(capacity).await?;

        self.operation_count.store(0, Ordering::Relaxed);
        *self.memory.lock() = MemorySnapshot::default();
        *self.last_restart_at.lock() = Instant::now();
        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Browser restarted (restart #{restarts}, generation {generation})");
        Ok(generation)
    }

    /// Restart when a threshold is exceeded; returns what triggered it
    pub async fn restart_if_needed(&self) -> Result<Option<RestartReason>, PoolError> {
        self.refresh_memory().await;
        let Some(reason) = self.restart_reason() else {
            return Ok(None);
        };
        info!("Browser restart triggered: {reason}");
        self.restart().await?;
        Ok(Some(reason))
    }

    /// Close browser tabs that neither the pool nor a lease accounts for.
    /// Returns how many were closed.
    pub async fn cleanup_orphaned_pages(&self) -> Result<usize, PoolError> {
        // A page being opened is not tracked until it is handed out
        if self.pool.has_pending_creations() {
            debug!("Orphan sweep skipped, pages are being opened");
            return Ok(0);
        }
        let browser = self.process.browser().await?;
        let tracked = self.pool.tracked_page_ids();
        let open: HashSet<String> = browser
            .open_page_ids()
            .await
            .map_err(PoolError::PageCreation)?
            .into_iter()
            .collect();

        let mut closed = 0;
        for id in open.difference(&tracked) {
            match browser.close_page(id).await {
                Ok(()) => closed += 1,
                Err(e) => debug!("Failed to close orphaned page {id}: {e}"),
            }
        }
        if closed > 0 {
            info!("Closed {closed} orphaned pages");
        }
        Ok(closed)
    }

    /// Sweep orphaned pages every `interval` until shutdown
    pub fn spawn_orphan_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = manager.cleanup_orphaned_pages().await {
                    debug!("Orphan sweep failed: {e}");
                }
            }
            debug!("Orphan sweeper exiting");
        });
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the sweeper, close pooled pages and the browser
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.pool.invalidate_all().await;
        self.process.close().await;
    }
}

impl Drop for BrowserLifecycleManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
