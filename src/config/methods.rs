//! Validation and values derived from `SyncConfig`

use std::time::Duration;

use super::types::{ConfigError, SyncConfig};
use crate::browser_pool::RestartPolicy;
use crate::browser_setup::LaunchSettings;
use crate::driver::NavigateOptions;
use crate::pipeline::SyncStage;
use crate::scrape_engine::{PollingStrategy, extract_domain};

const MAX_POOL_SIZE: usize = 32;
const MAX_STAGE_CONCURRENCY: usize = 64;

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

impl SyncConfig {
    /// Check ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.site_url).map_err(|e| invalid("site_url", e.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid("site_url", "URL has no host"));
        }

        if !(1..=MAX_POOL_SIZE).contains(&self.pool_size) {
            return Err(invalid(
                "pool_size",
                format!("{} not in 1..={MAX_POOL_SIZE}", self.pool_size),
            ));
        }

        for (stage, limit) in self.stage_concurrency.iter() {
            if !(1..=MAX_STAGE_CONCURRENCY).contains(&limit) {
                return Err(invalid(
                    "stage_concurrency",
                    format!("{stage} concurrency {limit} not in 1..={MAX_STAGE_CONCURRENCY}"),
                ));
            }
        }

        if PollingStrategy::preset(&self.polling_preset).is_none() {
            return Err(ConfigError::UnknownPreset(self.polling_preset.clone()));
        }

        if self.navigation_timeout_secs == 0 {
            return Err(invalid("navigation_timeout_secs", "must be greater than zero"));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(invalid("task_timeout_secs", "must be greater than zero"));
        }
        if self.max_operations_before_restart == 0 {
            return Err(invalid("max_operations_before_restart", "must be greater than zero"));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(invalid("circuit_failure_threshold", "must be greater than zero"));
        }
        if self.orphan_sweep_interval_secs == 0 {
            return Err(invalid("orphan_sweep_interval_secs", "must be greater than zero"));
        }

        if let Some(store) = &self.store_url {
            url::Url::parse(store).map_err(|e| invalid("store_url", e.to_string()))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }

    #[must_use]
    pub fn navigate_options(&self) -> NavigateOptions {
        NavigateOptions {
            timeout: self.navigation_timeout(),
            ..NavigateOptions::default()
        }
    }

    #[must_use]
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    #[must_use]
    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_interval_secs)
    }

    #[must_use]
    pub fn concurrency_for(&self, stage: SyncStage) -> usize {
        self.stage_concurrency.for_stage(stage)
    }

    /// The configured preset, falling back to `balanced` for unknown names
    #[must_use]
    pub fn polling_strategy(&self) -> PollingStrategy {
        PollingStrategy::preset(&self.polling_preset).unwrap_or_else(PollingStrategy::balanced)
    }

    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_operations: self.max_operations_before_restart,
            min_restart_interval: Duration::from_secs(self.min_restart_interval_secs),
            max_rss_bytes: self.max_rss_bytes,
            max_heap_bytes: self.max_heap_bytes,
        }
    }

    #[must_use]
    pub fn launch_settings(&self) -> LaunchSettings {
        LaunchSettings {
            headless: self.headless,
            proxy_server: self.proxy_server.clone(),
            ..LaunchSettings::default()
        }
    }

    /// Breaker channel for the configured site
    #[must_use]
    pub fn site_channel(&self) -> String {
        extract_domain(&self.site_url).unwrap_or_else(|_| self.site_url.clone())
    }
}
