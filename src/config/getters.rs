//! Getter methods for `SyncConfig`

use super::types::{StageConcurrency, SyncConfig};

impl SyncConfig {
    #[must_use]
    pub fn site_url(&self) -> &str {
        &self.site_url
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[must_use]
    pub fn headless(&self) -> bool {
        self.headless
    }

    #[must_use]
    pub fn stealth_mode(&self) -> bool {
        self.stealth_mode
    }

    #[must_use]
    pub fn proxy_server(&self) -> Option<&str> {
        self.proxy_server.as_deref()
    }

    #[must_use]
    pub fn stage_concurrency(&self) -> &StageConcurrency {
        &self.stage_concurrency
    }

    #[must_use]
    pub fn polling_preset(&self) -> &str {
        &self.polling_preset
    }

    #[must_use]
    pub fn max_operations_before_restart(&self) -> u64 {
        self.max_operations_before_restart
    }

    #[must_use]
    pub fn min_restart_interval_secs(&self) -> u64 {
        self.min_restart_interval_secs
    }

    #[must_use]
    pub fn max_rss_bytes(&self) -> Option<u64> {
        self.max_rss_bytes
    }

    #[must_use]
    pub fn max_heap_bytes(&self) -> Option<u64> {
        self.max_heap_bytes
    }

    #[must_use]
    pub fn navigation_timeout_secs(&self) -> u64 {
        self.navigation_timeout_secs
    }

    #[must_use]
    pub fn task_timeout_secs(&self) -> Option<u64> {
        self.task_timeout_secs
    }

    #[must_use]
    pub fn circuit_failure_threshold(&self) -> u32 {
        self.circuit_failure_threshold
    }

    #[must_use]
    pub fn circuit_cooldown_secs(&self) -> u64 {
        self.circuit_cooldown_secs
    }

    #[must_use]
    pub fn cancel_on_circuit_open(&self) -> bool {
        self.cancel_on_circuit_open
    }

    #[must_use]
    pub fn orphan_sweep_interval_secs(&self) -> u64 {
        self.orphan_sweep_interval_secs
    }

    #[must_use]
    pub fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    #[must_use]
    pub fn store_url(&self) -> Option<&str> {
        self.store_url.as_deref()
    }

    #[must_use]
    pub fn store_token(&self) -> Option<&str> {
        self.store_token.as_deref()
    }
}
