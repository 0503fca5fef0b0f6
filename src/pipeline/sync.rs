//! Wires the engine together for one sync run
//!
//! [`SyncPipeline`] owns the per-run coordinators (lifecycle manager, proxy
//! health, tracker, monitors) and hands each stage's processor a
//! [`StageContext`] through which it leases pages, navigates and records
//! writes.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use super::stage_tracker::{ProgressSink, RunProgress, StageError, StageRecord, StageTracker, StoreProgressSink};
use super::stages::SyncStage;
use super::store::{ContentStore, HttpContentStore, InMemoryStore, StoreError, UpsertOutcome, upsert_once};
use crate::browser_pool::{
    BrowserLifecycleManager, BrowserProcess, PageLease, PageResourcePool, PoolError, PoolStats,
    RestartReason,
};
use crate::config::SyncConfig;
use crate::driver::{BrowserLauncher, ChromiumLauncher, DriverError, ErrorClass, NavigateOptions, NavigationInfo};
use crate::scrape_engine::{
    AdaptivePollingDetector, BatchOutcome, CancellationSignal, CircuitBreaker, CircuitStatus,
    ContentProbe, CriticalSelector, ErrorDisposition, ParallelTaskRunner, PollOutcome, ProxyHealth,
    RateLimitGuard, RunOptions, StructureChange, StructureChangeMonitor, TaskError, extract_domain,
};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// `continue_on_error` was off and a task failed
    #[error("stage {stage} stopped at task {index}: {error}")]
    Aborted {
        stage: SyncStage,
        index: usize,
        error: TaskError,
    },
}

impl PipelineError {
    /// Only a browser that cannot be launched ends the run
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Pool(e) if e.is_fatal())
    }
}

/// Result of one stage
#[derive(Debug)]
pub struct StageReport<T, R> {
    pub stage: SyncStage,
    pub outcome: BatchOutcome<T, R>,
    pub record: StageRecord,
    /// Set when the browser was restarted before the stage ran
    pub restarted: Option<RestartReason>,
}

/// What a stage processor works with
#[derive(Clone)]
pub struct StageContext {
    stage: SyncStage,
    pool: Arc<PageResourcePool>,
    health: Arc<ProxyHealth>,
    detector: Arc<AdaptivePollingDetector>,
    monitor: Arc<StructureChangeMonitor>,
    tracker: Arc<StageTracker>,
    store: Arc<dyn ContentStore>,
    cancellation: CancellationSignal,
    navigate_options: NavigateOptions,
    cancel_on_circuit_open: bool,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StageContext {
    #[must_use]
    pub fn stage(&self) -> SyncStage {
        self.stage
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationSignal {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub async fn acquire(&self) -> Result<PageLease, PoolError> {
        self.pool.acquire().await
    }

    /// Navigate a leased page, honouring backoff and the circuit breaker.
    ///
    /// Failures are reported to the breaker/guard before being returned. A
    /// rate-limited page is marked so the pool evicts it on release.
    pub async fn navigate(&self, lease: &mut PageLease, url: &str) -> Result<NavigationInfo, DriverError> {
        let channel = extract_domain(url).unwrap_or_else(|_| url.to_string());

        if let Err(open) = self.health.admit(&channel).await {
            if self.cancel_on_circuit_open {
                self.cancellation.cancel(open.to_string());
            }
            return Err(DriverError::Connection {
                url: url.to_string(),
                message: open.to_string(),
            });
        }
        if lease.is_stale() {
            return Err(DriverError::PageClosed(format!(
                "lease from browser generation {} outlived a restart",
                lease.generation()
            )));
        }

        let result = lease.page().navigate(url, &self.navigate_options).await;
        match result {
            Ok(info) => {
                self.health.on_navigation_success(&channel);
                Ok(info)
            }
            Err(error) => {
                match self.health.on_navigation_error(&channel, &error, Some(lease)) {
                    ErrorDisposition::Connection {
                        circuit: CircuitStatus::Open,
                    } if self.cancel_on_circuit_open => {
                        self.cancellation.cancel(format!("circuit open for {channel}"));
                    }
                    _ if error.class() == ErrorClass::Disconnected => {
                        self.cancellation.cancel(format!("browser disconnected: {error}"));
                    }
                    _ => {}
                }
                Err(error)
            }
        }
    }

    /// Poll the leased page until `probe` finds content or gives up
    pub async fn wait_for_content(&self, lease: &PageLease, probe: &ContentProbe) -> Result<PollOutcome, DriverError> {
        self.detector.wait_for_content(lease.page().as_ref(), probe).await
    }

    /// Compare the page against the run's structure baseline.
    ///
    /// The first page checked becomes the baseline. Advisory only; read
    /// failures are logged and yield no changes.
    pub async fn check_structure(&self, lease: &PageLease) -> Vec<StructureChange> {
        match lease.page().content().await {
            Ok(html) => self.monitor.detect_changes_from_html(&html),
            Err(e) => {
                warn!("Structure check skipped: {e}");
                Vec::new()
            }
        }
    }

    /// Write a record at most once and count it against the stage
    pub async fn upsert(&self, resource_type: &str, key: &str, payload: Value) -> Result<UpsertOutcome, StoreError> {
        let outcome = upsert_once(self.store.as_ref(), resource_type, key, payload).await?;
        let counted = match outcome {
            UpsertOutcome::Created => self.tracker.add_new(self.stage, 1).await,
            UpsertOutcome::Updated => self.tracker.add_updated(self.stage, 1).await,
            UpsertOutcome::Unchanged => Ok(()),
        };
        if let Err(e) = counted {
            warn!("Upsert not counted: {e}");
        }
        Ok(outcome)
    }

    /// Count records removed during cleanup
    pub async fn record_deleted(&self, count: u64) {
        if let Err(e) = self.tracker.add_deleted(self.stage, count).await {
            warn!("Deletions not counted: {e}");
        }
    }
}

/// One sync run
pub struct SyncPipeline {
    config: Arc<SyncConfig>,
    lifecycle: Arc<BrowserLifecycleManager>,
    health: Arc<ProxyHealth>,
    detector: Arc<AdaptivePollingDetector>,
    monitor: Arc<StructureChangeMonitor>,
    tracker: Arc<StageTracker>,
    store: Arc<dyn ContentStore>,
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("site", &self.config.site_url())
            .field("pool", &self.lifecycle.pool().stats())
            .finish_non_exhaustive()
    }
}

impl SyncPipeline {
    /// Launch Chromium and open the configured store
    pub async fn launch(config: SyncConfig) -> Result<Self, PipelineError> {
        let launcher = ChromiumLauncher::new(config.launch_settings()).with_stealth(config.stealth_mode());
        let store = store_from_config(&config)?;
        Self::start(config, Arc::new(launcher), store).await
    }

    /// Launch through `launcher`; progress is persisted into `store`
    pub async fn start(
        config: SyncConfig,
        launcher: Arc<dyn BrowserLauncher>,
        store: Arc<dyn ContentStore>,
    ) -> Result<Self, PipelineError> {
        let sink: Arc<dyn ProgressSink> = Arc::new(StoreProgressSink::new(Arc::clone(&store)));
        Self::start_with_sink(config, launcher, store, sink).await
    }

    pub async fn start_with_sink(
        config: SyncConfig,
        launcher: Arc<dyn BrowserLauncher>,
        store: Arc<dyn ContentStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, PipelineError> {
        let process = Arc::new(BrowserProcess::new(launcher));
        let pool = PageResourcePool::new(process, config.pool_size());
        let lifecycle = Arc::new(BrowserLifecycleManager::new(pool, config.restart_policy()));

        let opened = lifecycle.start().await?;
        lifecycle.spawn_orphan_sweeper(config.orphan_sweep_interval());

        let health = ProxyHealth::new(
            CircuitBreaker::new(config.circuit_failure_threshold(), config.circuit_cooldown()),
            RateLimitGuard::new(),
        );
        let tracker = StageTracker::new(sink);
        info!(
            "Sync run {} started against {} with {opened} pages",
            tracker.run_id().await,
            config.site_url()
        );

        Ok(Self {
            detector: Arc::new(AdaptivePollingDetector::new(config.polling_strategy())),
            monitor: Arc::new(StructureChangeMonitor::new(Vec::new())),
            health: Arc::new(health),
            tracker: Arc::new(tracker),
            config: Arc::new(config),
            lifecycle,
            store,
        })
    }

    /// Selectors the structure monitor snapshots
    #[must_use]
    pub fn with_critical_selectors(mut self, selectors: Vec<CriticalSelector>) -> Self {
        self.monitor = Arc::new(StructureChangeMonitor::new(selectors));
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Arc<BrowserLifecycleManager> {
        &self.lifecycle
    }

    #[must_use]
    pub fn proxy_health(&self) -> &Arc<ProxyHealth> {
        &self.health
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<AdaptivePollingDetector> {
        &self.detector
    }

    #[must_use]
    pub fn structure_monitor(&self) -> &Arc<StructureChangeMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<StageTracker> {
        &self.tracker
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.lifecycle.pool().stats()
    }

    fn stage_context(&self, stage: SyncStage) -> StageContext {
        StageContext {
            stage,
            pool: Arc::clone(self.lifecycle.pool()),
            health: Arc::clone(&self.health),
            detector: Arc::clone(&self.detector),
            monitor: Arc::clone(&self.monitor),
            tracker: Arc::clone(&self.tracker),
            store: Arc::clone(&self.store),
            cancellation: CancellationSignal::new(),
            navigate_options: self.config.navigate_options(),
            cancel_on_circuit_open: self.config.cancel_on_circuit_open(),
        }
    }

    /// Run one stage over `items`.
    ///
    /// Restarts the browser first when a threshold is exceeded, then runs the
    /// batch at the stage's concurrency and completes the stage. Task errors
    /// other than page-closed artifacts are added to the stage's error count.
    pub async fn run_stage<T, R, F, Fut>(
        &self,
        stage: SyncStage,
        items: Vec<T>,
        processor: F,
    ) -> Result<StageReport<T, R>, PipelineError>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(StageContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let restarted = self.lifecycle.restart_if_needed().await?;

        self.tracker.start_stage(stage).await?;
        self.tracker.add_found(stage, items.len() as u64).await?;

        let ctx = self.stage_context(stage);
        let mut options = RunOptions::default()
            .with_context(stage.as_str())
            .with_progress()
            .with_cancellation(ctx.cancellation.clone());
        options.continue_on_error = self.config.continue_on_error();
        options.task_timeout = self.config.task_timeout();

        let runner = ParallelTaskRunner::new(self.config.concurrency_for(stage));
        let lifecycle = Arc::clone(&self.lifecycle);
        let run = runner
            .run(
                items,
                move |item, _index| {
                    let work = processor(ctx.clone(), item);
                    let lifecycle = Arc::clone(&lifecycle);
                    async move {
                        let result = work.await;
                        lifecycle.record_operation();
                        result
                    }
                },
                options,
            )
            .await;

        let (outcome, aborted) = match run {
            Ok(outcome) => (outcome, None),
            Err(aborted) => (aborted.outcome, Some((aborted.index, aborted.error))),
        };

        self.tracker.add_errors(stage, outcome.genuine_errors() as u64).await?;
        let record = self.tracker.complete_stage(stage).await?;

        if let Some((index, error)) = aborted {
            return Err(PipelineError::Aborted { stage, index, error });
        }
        Ok(StageReport {
            stage,
            outcome,
            record,
            restarted,
        })
    }

    /// Mark every pending stage before `stage` as completed without running it
    pub async fn skip_to(&self, stage: SyncStage) -> Result<(), PipelineError> {
        let pending = self.tracker.snapshot().await.pending_stages;
        for earlier in pending.into_iter().take_while(|s| *s != stage) {
            info!("Stage {earlier} skipped");
            self.tracker.complete_stage(earlier).await?;
        }
        Ok(())
    }

    /// Close the browser and persist the final progress record
    pub async fn finish(self) -> RunProgress {
        self.lifecycle.shutdown().await;
        let progress = self.tracker.finish().await;
        let polling = self.detector.metrics();
        info!(
            "Sync run {} finished: {} errors, polling success rate {:.0}% over {} pages",
            progress.run_id,
            progress.total_errors(),
            polling.success_rate() * 100.0,
            polling.calls
        );
        progress
    }
}

/// HTTP store when a store URL is configured, in-memory otherwise
pub fn store_from_config(config: &SyncConfig) -> Result<Arc<dyn ContentStore>, StoreError> {
    match config.store_url() {
        Some(url) => Ok(Arc::new(HttpContentStore::new(
            url,
            config.store_token().map(str::to_string),
        )?)),
        None => {
            warn!("No store URL configured, records are kept in memory only");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
