//! Type-safe builder for `SyncConfig` using the typestate pattern
//!
//! The site URL is the only required field; `build` is available once it
//! has been set and validates the remaining values.

use std::marker::PhantomData;

use super::types::{ConfigError, StageConcurrency, SyncConfig};
use crate::pipeline::SyncStage;

// Type states for the builder
pub struct WithSiteUrl;

pub struct SyncConfigBuilder<State = ()> {
    pub(crate) config: SyncConfig,
    pub(crate) _phantom: PhantomData<State>,
}

impl Default for SyncConfigBuilder<()> {
    fn default() -> Self {
        Self {
            config: SyncConfig::default(),
            _phantom: PhantomData,
        }
    }
}

impl SyncConfig {
    /// Create a builder for configuring a `SyncConfig` with a fluent interface
    #[must_use]
    pub fn builder() -> SyncConfigBuilder<()> {
        SyncConfigBuilder::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

impl SyncConfigBuilder<()> {
    pub fn site_url(mut self, url: impl Into<String>) -> SyncConfigBuilder<WithSiteUrl> {
        let url_string = url.into();

        // Normalize URL: add https:// if no scheme is present
        self.config.site_url =
            if url_string.starts_with("http://") || url_string.starts_with("https://") {
                url_string
            } else {
                format!("https://{url_string}")
            };

        SyncConfigBuilder {
            config: self.config,
            _phantom: PhantomData,
        }
    }
}

impl<State> SyncConfigBuilder<State> {
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    #[must_use]
    pub fn stealth_mode(mut self, stealth: bool) -> Self {
        self.config.stealth_mode = stealth;
        self
    }

    #[must_use]
    pub fn proxy_server(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy_server = Some(proxy.into());
        self
    }

    #[must_use]
    pub fn stage_concurrency(mut self, concurrency: StageConcurrency) -> Self {
        self.config.stage_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn concurrency_for(mut self, stage: SyncStage, limit: usize) -> Self {
        let c = &mut self.config.stage_concurrency;
        match stage {
            SyncStage::Competitions => c.competitions = limit,
            SyncStage::Teams => c.teams = limit,
            SyncStage::Games => c.games = limit,
            SyncStage::FixtureValidation => c.validation = limit,
            SyncStage::FixtureCleanup => c.cleanup = limit,
        }
        self
    }

    #[must_use]
    pub fn polling_preset(mut self, preset: impl Into<String>) -> Self {
        self.config.polling_preset = preset.into();
        self
    }

    #[must_use]
    pub fn max_operations_before_restart(mut self, ops: u64) -> Self {
        self.config.max_operations_before_restart = ops;
        self
    }

    #[must_use]
    pub fn min_restart_interval_secs(mut self, secs: u64) -> Self {
        self.config.min_restart_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn max_rss_bytes(mut self, bytes: u64) -> Self {
        self.config.max_rss_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn max_heap_bytes(mut self, bytes: u64) -> Self {
        self.config.max_heap_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn navigation_timeout_secs(mut self, secs: u64) -> Self {
        self.config.navigation_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn task_timeout_secs(mut self, secs: u64) -> Self {
        self.config.task_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn circuit_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.circuit_failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn circuit_cooldown_secs(mut self, secs: u64) -> Self {
        self.config.circuit_cooldown_secs = secs;
        self
    }

    #[must_use]
    pub fn cancel_on_circuit_open(mut self, cancel: bool) -> Self {
        self.config.cancel_on_circuit_open = cancel;
        self
    }

    #[must_use]
    pub fn orphan_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.orphan_sweep_interval_secs = secs;
        self
    }

    #[must_use]
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.config.continue_on_error = continue_on_error;
        self
    }

    #[must_use]
    pub fn store(mut self, url: impl Into<String>, token: Option<String>) -> Self {
        self.config.store_url = Some(url.into());
        self.config.store_token = token;
        self
    }
}

// Build method only available when all required fields are set
impl SyncConfigBuilder<WithSiteUrl> {
    pub fn build(self) -> Result<SyncConfig, ConfigError> {
        // Enforce headless mode in release builds for production safety
        #[cfg(not(debug_assertions))]
        let config = {
            let mut config = self.config;
            if !config.headless {
                tracing::warn!(
                    "Forcing headless mode in release build. \
                    Headed mode is only available in debug builds for development."
                );
                config.headless = true;
            }
            config
        };
        #[cfg(debug_assertions)]
        let config = self.config;

        config.validate()?;
        Ok(config)
    }
}
