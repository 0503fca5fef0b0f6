//! Pooled browser pages with generation-tagged leases
//!
//! The pool keeps `capacity` permanent pages open on the current browser
//! process. `acquire` never waits: when every permanent page is leased it
//! hands out an ephemeral page that is closed on release instead of being
//! pooled, so bursts cost throughput rather than unbounded growth.
//!
//! Every entry carries the generation of the browser incarnation that created
//! it. A restart bumps the generation; entries from an older generation are
//! discarded when they come back.

mod lifecycle;
mod memory;
mod process;

pub use lifecycle::{BrowserLifecycleManager, RestartPolicy, RestartReason};
pub use memory::{MemoryProbe, MemorySnapshot, ProcStatusProbe};
pub use process::BrowserProcess;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::driver::{DriverError, PageDriver};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The browser process could not be started. Fatal for a run.
    #[error("failed to launch browser: {0}")]
    Launch(#[source] DriverError),

    #[error("browser process is not running")]
    NotRunning,

    #[error("failed to open page: {0}")]
    PageCreation(#[source] DriverError),

    #[error("no page could be opened out of {requested} requested: {source}")]
    Initialize {
        requested: usize,
        #[source]
        source: Box<PoolError>,
    },
}

impl PoolError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Launch(_) => true,
            Self::Initialize { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

// =============================================================================
// Entries
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrigin {
    /// Counts against capacity and is returned to the pool on release
    Permanent,
    /// Created past capacity; closed on release
    Ephemeral,
}

/// A page owned by the pool
#[derive(Debug)]
pub struct PoolEntry {
    pub id: u64,
    pub page: Arc<dyn PageDriver>,
    pub generation: u64,
    pub origin: EntryOrigin,
    pub healthy: bool,
    pub created_at: Instant,
}

#[derive(Debug)]
struct PoolState {
    available: VecDeque<PoolEntry>,
    capacity: usize,
    generation: u64,
    /// Permanent entries of the current generation, available or leased
    permanent_live: usize,
}

#[derive(Debug, Clone)]
struct LeaseInfo {
    page_id: String,
    origin: EntryOrigin,
    generation: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    ephemeral_issued: AtomicU64,
    ephemeral_disposed: AtomicU64,
    stale_discarded: AtomicU64,
    dead_replaced: AtomicU64,
    evicted: AtomicU64,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub generation: u64,
    pub available: usize,
    /// Permanent entries of the current generation, available or leased
    pub permanent: usize,
    pub leased_permanent: usize,
    pub leased_ephemeral: usize,
    pub ephemeral_issued: u64,
    pub ephemeral_disposed: u64,
    pub stale_discarded: u64,
    pub dead_replaced: u64,
    pub evicted: u64,
}

/// Why a lease should not go back into the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Presumed to sit on a penalised proxy session
    RateLimited,
    Unhealthy,
}

enum Disposal {
    Returned,
    Close { entry: PoolEntry, replenish: bool },
}

// =============================================================================
// Pool
// =============================================================================

/// Fixed-capacity pool of pages on the current browser process
#[derive(Debug)]
pub struct PageResourcePool {
    process: Arc<BrowserProcess>,
    state: parking_lot::Mutex<PoolState>,
    leased: DashMap<u64, LeaseInfo>,
    next_id: AtomicU64,
    /// Pages being opened or health-checked that neither set tracks
    in_transit: AtomicUsize,
    counters: PoolCounters,
}

impl PageResourcePool {
    #[must_use]
    pub fn new(process: Arc<BrowserProcess>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            process,
            state: parking_lot::Mutex::new(PoolState {
                available: VecDeque::new(),
                capacity,
                generation: 0,
                permanent_live: 0,
            }),
            leased: DashMap::new(),
            next_id: AtomicU64::new(0),
            in_transit: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        })
    }

    #[must_use]
    pub fn process(&self) -> &Arc<BrowserProcess> {
        &self.process
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Open `size` permanent pages for the current generation.
    ///
    /// No-op while the pool still holds permanent pages. Succeeds with
    /// however many pages opened, failing only when none did.
    pub async fn initialize(&self, size: usize) -> Result<usize, PoolError> {
        let generation = {
            let mut state = self.state.lock();
            if state.permanent_live > 0 {
                debug!("Pool already initialized with {} pages", state.permanent_live);
                return Ok(0);
            }
            state.capacity = size;
            state.permanent_live = size;
            state.generation
        };

        let created = join_all((0..size).map(|_| self.open_page())).await;

        let mut opened = 0;
        let mut last_error = None;
        let mut orphans = Vec::new();
        {
            let mut state = self.state.lock();
            for result in created {
                match result {
                    Ok(page) if state.generation == generation => {
                        state.available.push_back(self.entry(page, generation, EntryOrigin::Permanent));
                        opened += 1;
                    }
                    Ok(page) => orphans.push(page),
                    Err(e) => {
                        if state.generation == generation {
                            state.permanent_live = state.permanent_live.saturating_sub(1);
                        }
                        last_error = Some(e);
                    }
                }
            }
        }
        for page in orphans {
            close_quietly(page.as_ref()).await;
        }

        if let Some(source) = last_error {
            if opened == 0 && size > 0 {
                return Err(PoolError::Initialize {
                    requested: size,
                    source: Box::new(source),
                });
            }
            warn!("Pool initialized with {opened}/{size} pages: {source}");
        } else {
            info!("Pool initialized with {opened} pages (generation {generation})");
        }
        Ok(opened)
    }

    /// Lease a live page. Never waits for another lease to be returned.
    pub async fn acquire(self: &Arc<Self>) -> Result<PageLease, PoolError> {
        loop {
            let popped = self.state.lock().available.pop_front();
            if let Some(entry) = popped {
                self.in_transit.fetch_add(1, Ordering::AcqRel);
                let alive = entry.page.is_alive().await;
                if alive {
                    let lease = self.lease(entry);
                    self.in_transit.fetch_sub(1, Ordering::AcqRel);
                    return Ok(lease);
                }
                self.in_transit.fetch_sub(1, Ordering::AcqRel);
                warn!("Pooled page {} is dead, replacing it", entry.page.id());
                self.counters.dead_replaced.fetch_add(1, Ordering::Relaxed);
                {
                    let mut state = self.state.lock();
                    if entry.generation == state.generation {
                        state.permanent_live = state.permanent_live.saturating_sub(1);
                    }
                }
                close_quietly(entry.page.as_ref()).await;
                continue;
            }

            let (origin, generation) = {
                let mut state = self.state.lock();
                let origin = if state.permanent_live < state.capacity {
                    state.permanent_live += 1;
                    EntryOrigin::Permanent
                } else {
                    EntryOrigin::Ephemeral
                };
                (origin, state.generation)
            };

            return match self.open_page().await {
                Ok(page) => {
                    if origin == EntryOrigin::Ephemeral {
                        self.counters.ephemeral_issued.fetch_add(1, Ordering::Relaxed);
                        debug!("Pool exhausted, issuing ephemeral page {}", page.id());
                    }
                    Ok(self.lease(self.entry(page, generation, origin)))
                }
                Err(e) => {
                    if origin == EntryOrigin::Permanent {
                        self.release_slot(generation);
                    }
                    Err(e)
                }
            };
        }
    }

    fn entry(&self, page: Arc<dyn PageDriver>, generation: u64, origin: EntryOrigin) -> PoolEntry {
        PoolEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            page,
            generation,
            origin,
            healthy: true,
            created_at: Instant::now(),
        }
    }

    fn lease(self: &Arc<Self>, entry: PoolEntry) -> PageLease {
        self.leased.insert(
            entry.id,
            LeaseInfo {
                page_id: entry.page.id().to_string(),
                origin: entry.origin,
                generation: entry.generation,
            },
        );
        PageLease {
            page: Arc::clone(&entry.page),
            generation: entry.generation,
            origin: entry.origin,
            entry: Some(entry),
            eviction: None,
            pool: Arc::clone(self),
        }
    }

    async fn open_page(&self) -> Result<Arc<dyn PageDriver>, PoolError> {
        self.in_transit.fetch_add(1, Ordering::AcqRel);
        let result = async {
            let browser = self.process.browser().await?;
            browser.new_page().await.map_err(PoolError::PageCreation)
        }
        .await;
        self.in_transit.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn release_slot(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.permanent_live = state.permanent_live.saturating_sub(1);
        }
    }

    /// Bookkeeping half of a release; never awaits
    fn settle(&self, entry: PoolEntry, eviction: Option<Eviction>) -> Disposal {
        let id = entry.id;
        let disposal = self.dispose(entry, eviction);
        // Only after the entry is back in `available`, so sweeps always see it
        self.leased.remove(&id);
        disposal
    }

    fn dispose(&self, mut entry: PoolEntry, eviction: Option<Eviction>) -> Disposal {
        let mut state = self.state.lock();

        if entry.generation != state.generation {
            self.counters.stale_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Discarding page {} from generation {} (current {})",
                entry.page.id(),
                entry.generation,
                state.generation
            );
            return Disposal::Close { entry, replenish: false };
        }

        match entry.origin {
            EntryOrigin::Ephemeral => {
                self.counters.ephemeral_disposed.fetch_add(1, Ordering::Relaxed);
                Disposal::Close { entry, replenish: false }
            }
            EntryOrigin::Permanent if eviction.is_some() || !entry.healthy => {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                state.permanent_live = state.permanent_live.saturating_sub(1);
                info!("Evicting page {} from pool ({:?})", entry.page.id(), eviction);
                Disposal::Close { entry, replenish: true }
            }
            EntryOrigin::Permanent => {
                entry.healthy = true;
                state.available.push_back(entry);
                Disposal::Returned
            }
        }
    }

    /// Return a leased entry
    pub(crate) async fn release(&self, entry: PoolEntry, eviction: Option<Eviction>) {
        if let Disposal::Close { entry, replenish } = self.settle(entry, eviction) {
            close_quietly(entry.page.as_ref()).await;
            if replenish {
                self.replenish().await;
            }
        }
    }

    /// Refill one permanent slot after an eviction
    async fn replenish(&self) {
        let generation = {
            let mut state = self.state.lock();
            if state.permanent_live >= state.capacity {
                return;
            }
            state.permanent_live += 1;
            state.generation
        };

        match self.open_page().await {
            Ok(page) => {
                let entry = self.entry(page, generation, EntryOrigin::Permanent);
                let stale = {
                    let mut state = self.state.lock();
                    if state.generation == generation {
                        state.available.push_back(entry);
                        None
                    } else {
                        Some(entry)
                    }
                };
                if let Some(entry) = stale {
                    close_quietly(entry.page.as_ref()).await;
                }
            }
            Err(e) => {
                warn!("Failed to replenish pool: {e}");
                self.release_slot(generation);
            }
        }
    }

    /// Start a new generation: pooled pages are closed and outstanding leases
    /// become stale. Returns the new generation.
    pub async fn invalidate_all(&self) -> u64 {
        let (drained, generation) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.permanent_live = 0;
            (state.available.drain(..).collect::<Vec<_>>(), state.generation)
        };
        let outstanding = self.leased.len();
        info!(
            "Pool invalidated: generation {generation}, closing {} pooled pages, {outstanding} leases outstanding",
            drained.len()
        );
        join_all(drained.iter().map(|entry| close_quietly(entry.page.as_ref()))).await;
        generation
    }

    /// Page ids the pool or an active lease accounts for
    #[must_use]
    pub fn tracked_page_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self
            .state
            .lock()
            .available
            .iter()
            .map(|e| e.page.id().to_string())
            .collect();
        ids.extend(self.leased.iter().map(|l| l.value().page_id.clone()));
        ids
    }

    /// Whether pages are being opened right now
    #[must_use]
    pub fn has_pending_creations(&self) -> bool {
        self.in_transit.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn outstanding_leases(&self) -> usize {
        self.leased.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (capacity, generation, available, permanent) = {
            let state = self.state.lock();
            (state.capacity, state.generation, state.available.len(), state.permanent_live)
        };
        let mut leased_permanent = 0;
        let mut leased_ephemeral = 0;
        for lease in &self.leased {
            if lease.generation != generation {
                continue;
            }
            match lease.origin {
                EntryOrigin::Permanent => leased_permanent += 1,
                EntryOrigin::Ephemeral => leased_ephemeral += 1,
            }
        }
        PoolStats {
            capacity,
            generation,
            available,
            permanent,
            leased_permanent,
            leased_ephemeral,
            ephemeral_issued: self.counters.ephemeral_issued.load(Ordering::Relaxed),
            ephemeral_disposed: self.counters.ephemeral_disposed.load(Ordering::Relaxed),
            stale_discarded: self.counters.stale_discarded.load(Ordering::Relaxed),
            dead_replaced: self.counters.dead_replaced.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

async fn close_quietly(page: &dyn PageDriver) {
    if let Err(e) = page.close().await {
        debug!("Closing page {} failed: {e}", page.id());
    }
}

// =============================================================================
// RAII Lease
// =============================================================================

/// Exclusive use of one pooled page.
///
/// Dropping the lease returns the page on a spawned task; call
/// [`PageLease::release`] to wait for the return to finish.
pub struct PageLease {
    page: Arc<dyn PageDriver>,
    generation: u64,
    origin: EntryOrigin,
    entry: Option<PoolEntry>,
    eviction: Option<Eviction>,
    pool: Arc<PageResourcePool>,
}

impl std::fmt::Debug for PageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("page", &self.page.id())
            .field("generation", &self.generation)
            .field("origin", &self.origin)
            .field("eviction", &self.eviction)
            .finish()
    }
}

impl PageLease {
    #[must_use]
    pub fn page(&self) -> &Arc<dyn PageDriver> {
        &self.page
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn origin(&self) -> EntryOrigin {
        self.origin
    }

    /// Whether a restart happened since this lease was taken
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.generation != self.pool.generation()
    }

    /// Evict instead of returning to the pool
    pub fn mark_rate_limited(&mut self) {
        self.eviction = Some(Eviction::RateLimited);
    }

    pub fn mark_unhealthy(&mut self) {
        if self.eviction.is_none() {
            self.eviction = Some(Eviction::Unhealthy);
        }
        if let Some(entry) = self.entry.as_mut() {
            entry.healthy = false;
        }
    }

    #[must_use]
    pub fn eviction(&self) -> Option<Eviction> {
        self.eviction
    }

    /// Return the page and wait until the pool has settled it
    pub async fn release(mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry, self.eviction).await;
        }
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let eviction = self.eviction;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.release(entry, eviction).await;
                });
            }
            // Outside a runtime the page cannot be closed; keep the books straight
            Err(_) => {
                let _ = pool.settle(entry, eviction);
            }
        }
    }
}
