//! Core configuration types for a sync run
//!
//! Values are read once at startup; nothing here is reloaded while a run is
//! in progress.

use serde::{Deserialize, Serialize};

use crate::pipeline::SyncStage;
use crate::utils::constants::{
    DEFAULT_CIRCUIT_COOLDOWN_SECS, DEFAULT_CIRCUIT_FAILURE_THRESHOLD, DEFAULT_CLEANUP_CONCURRENCY,
    DEFAULT_COMPETITIONS_CONCURRENCY, DEFAULT_GAMES_CONCURRENCY,
    DEFAULT_MAX_OPERATIONS_BEFORE_RESTART, DEFAULT_MIN_RESTART_INTERVAL_SECS,
    DEFAULT_NAVIGATION_TIMEOUT_SECS, DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS, DEFAULT_POLLING_PRESET,
    DEFAULT_POOL_SIZE, DEFAULT_TEAMS_CONCURRENCY, DEFAULT_VALIDATION_CONCURRENCY,
};

/// How many tasks each stage runs at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConcurrency {
    pub competitions: usize,
    pub teams: usize,
    pub games: usize,
    pub validation: usize,
    pub cleanup: usize,
}

impl Default for StageConcurrency {
    fn default() -> Self {
        Self {
            competitions: DEFAULT_COMPETITIONS_CONCURRENCY,
            teams: DEFAULT_TEAMS_CONCURRENCY,
            games: DEFAULT_GAMES_CONCURRENCY,
            validation: DEFAULT_VALIDATION_CONCURRENCY,
            cleanup: DEFAULT_CLEANUP_CONCURRENCY,
        }
    }
}

impl StageConcurrency {
    #[must_use]
    pub fn for_stage(&self, stage: SyncStage) -> usize {
        match stage {
            SyncStage::Competitions => self.competitions,
            SyncStage::Teams => self.teams,
            SyncStage::Games => self.games,
            SyncStage::FixtureValidation => self.validation,
            SyncStage::FixtureCleanup => self.cleanup,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SyncStage, usize)> + '_ {
        SyncStage::ALL.into_iter().map(|stage| (stage, self.for_stage(stage)))
    }
}

/// Main configuration for a sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Site the pipeline scrapes; its host is the breaker channel
    pub(crate) site_url: String,
    pub(crate) pool_size: usize,
    pub(crate) headless: bool,
    pub(crate) stealth_mode: bool,
    pub(crate) proxy_server: Option<String>,
    pub(crate) stage_concurrency: StageConcurrency,
    /// One of `fast`, `balanced`, `patient`, `aggressive`
    pub(crate) polling_preset: String,
    pub(crate) max_operations_before_restart: u64,
    pub(crate) min_restart_interval_secs: u64,
    pub(crate) max_rss_bytes: Option<u64>,
    pub(crate) max_heap_bytes: Option<u64>,
    pub(crate) navigation_timeout_secs: u64,
    /// Upper bound on one task; `None` leaves tasks to their own timeouts
    pub(crate) task_timeout_secs: Option<u64>,
    pub(crate) circuit_failure_threshold: u32,
    pub(crate) circuit_cooldown_secs: u64,
    /// Stop scheduling a stage's remaining tasks once the site's circuit opens
    pub(crate) cancel_on_circuit_open: bool,
    pub(crate) orphan_sweep_interval_secs: u64,
    pub(crate) continue_on_error: bool,
    pub(crate) store_url: Option<String>,
    #[serde(skip_serializing)]
    pub(crate) store_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            headless: true,
            stealth_mode: true,
            proxy_server: None,
            stage_concurrency: StageConcurrency::default(),
            polling_preset: DEFAULT_POLLING_PRESET.to_string(),
            max_operations_before_restart: DEFAULT_MAX_OPERATIONS_BEFORE_RESTART,
            min_restart_interval_secs: DEFAULT_MIN_RESTART_INTERVAL_SECS,
            max_rss_bytes: None,
            max_heap_bytes: None,
            navigation_timeout_secs: DEFAULT_NAVIGATION_TIMEOUT_SECS,
            task_timeout_secs: None,
            circuit_failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            circuit_cooldown_secs: DEFAULT_CIRCUIT_COOLDOWN_SECS,
            cancel_on_circuit_open: true,
            orphan_sweep_interval_secs: DEFAULT_ORPHAN_SWEEP_INTERVAL_SECS,
            continue_on_error: true,
            store_url: None,
            store_token: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("unknown polling preset '{0}'")]
    UnknownPreset(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
