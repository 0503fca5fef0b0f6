pub mod browser_pool;
pub mod browser_profile;
pub mod browser_setup;
pub mod config;
pub mod driver;
pub mod pipeline;
pub mod scrape_engine;
pub mod telemetry;
pub mod utils;

pub use browser_pool::{
    BrowserLifecycleManager, BrowserProcess, PageLease, PageResourcePool, PoolError, PoolStats,
    RestartPolicy,
};
pub use browser_setup::{
    LaunchSettings, apply_stealth_measures, download_managed_browser, find_browser_executable,
    launch_browser,
};
pub use config::{ConfigError, SyncConfig, SyncConfigBuilder};
pub use driver::{
    BrowserDriver, BrowserLauncher, ChromiumLauncher, DriverError, DriverResult, ErrorClass,
    NavigateOptions, NavigationInfo, PageDriver, PageProbe,
};
pub use pipeline::{
    ContentStore, HttpContentStore, InMemoryStore, PipelineError, RunProgress, StageContext,
    StageReport, StageTracker, SyncPipeline, SyncStage,
};
pub use scrape_engine::{
    AdaptivePollingDetector, CancellationSignal, CircuitBreaker, ContentProbe, CriticalSelector,
    ParallelTaskRunner, PollOutcome, PollingStrategy, ProxyHealth, RateLimitGuard, RunOptions,
    StructureChangeMonitor, TaskError,
};
pub use telemetry::init_tracing;

/// Launch a browser, fill the pool and return a pipeline ready for `run_stage`
pub async fn start_sync(config: SyncConfig) -> Result<SyncPipeline, PipelineError> {
    SyncPipeline::launch(config).await
}
