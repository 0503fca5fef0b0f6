//! Adaptive polling for client-rendered content
//!
//! The target site renders its tables after the `load` event, sometimes many
//! seconds later, and sometimes renders an explicit "no fixtures available"
//! message instead. The detector polls the page's DOM on a growing schedule and
//! tells the three situations apart:
//!
//! - [`PollOutcome::Found`]: the container exists and holds at least one item
//!   with real text
//! - [`PollOutcome::Absent`]: the page says there is nothing to show; returned
//!   after a single check
//! - [`PollOutcome::NotFound`]: attempts ran out; undetermined, not an error

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::page_timeout::with_timeout;
use crate::driver::{DriverResult, PageDriver};

/// Names accepted by [`PollingStrategy::preset`]
pub const PRESET_NAMES: &[&str] = &["fast", "balanced", "patient", "aggressive"];

/// Backoff schedule for one polling call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollingStrategy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_attempts: u32,
    /// Delay before the first attempt
    pub quick_check_delay: Duration,
    /// Deadline for reading the DOM once
    pub check_timeout: Duration,
}

impl PollingStrategy {
    #[must_use]
    pub const fn balanced() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(15000),
            backoff_multiplier: 1.8,
            max_attempts: 4,
            quick_check_delay: Duration::from_millis(1000),
            check_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn fast() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 1.5,
            max_attempts: 3,
            quick_check_delay: Duration::from_millis(300),
            check_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub const fn patient() -> Self {
        Self {
            initial_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(30000),
            backoff_multiplier: 2.0,
            max_attempts: 6,
            quick_check_delay: Duration::from_millis(1500),
            check_timeout: Duration::from_secs(15),
        }
    }

    #[must_use]
    pub const fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            backoff_multiplier: 1.5,
            max_attempts: 5,
            quick_check_delay: Duration::from_millis(500),
            check_timeout: Duration::from_secs(8),
        }
    }

    /// Look a preset up by name
    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "fast" => Some(Self::fast()),
            "balanced" => Some(Self::balanced()),
            "patient" => Some(Self::patient()),
            "aggressive" => Some(Self::aggressive()),
            _ => None,
        }
    }

    /// Waits preceding each attempt, in order
    #[must_use]
    pub fn delay_schedule(&self) -> Vec<Duration> {
        let attempts = self.max_attempts.max(1) as usize;
        let mut delays = Vec::with_capacity(attempts);
        delays.push(self.quick_check_delay);
        let mut current = self.initial_delay.min(self.max_delay);
        while delays.len() < attempts {
            delays.push(current);
            current = current.mul_f64(self.backoff_multiplier).min(self.max_delay);
        }
        delays
    }
}

impl Default for PollingStrategy {
    fn default() -> Self {
        Self::balanced()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("invalid selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

fn parse_selector(css: &str) -> Result<Selector, ProbeError> {
    Selector::parse(css).map_err(|e| ProbeError::InvalidSelector {
        selector: css.to_string(),
        message: format!("{e:?}"),
    })
}

/// What "rendered" and "explicitly empty" look like for one page type
#[derive(Debug, Clone)]
pub struct ContentProbe {
    container: Selector,
    item: Selector,
    unavailable_selectors: Vec<Selector>,
    unavailable_texts: Vec<String>,
}

impl ContentProbe {
    /// `item` is matched inside `container`
    pub fn new(container: &str, item: &str) -> Result<Self, ProbeError> {
        Ok(Self {
            container: parse_selector(container)?,
            item: parse_selector(item)?,
            unavailable_selectors: Vec::new(),
            unavailable_texts: Vec::new(),
        })
    }

    /// An element whose presence means "nothing to show"
    pub fn unavailable_selector(mut self, css: &str) -> Result<Self, ProbeError> {
        self.unavailable_selectors.push(parse_selector(css)?);
        Ok(self)
    }

    /// Body text (case-insensitive) that means "nothing to show"
    #[must_use]
    pub fn unavailable_text(mut self, text: &str) -> Self {
        self.unavailable_texts.push(text.to_lowercase());
        self
    }

    /// Inspect one DOM snapshot
    #[must_use]
    pub fn inspect(&self, html: &str) -> Observation {
        let document = Html::parse_document(html);

        let selector_negative = self
            .unavailable_selectors
            .iter()
            .any(|s| document.select(s).next().is_some());
        let terminal_negative = selector_negative || {
            if self.unavailable_texts.is_empty() {
                false
            } else {
                let text = document
                    .root_element()
                    .text()
                    .collect::<String>()
                    .to_lowercase();
                self.unavailable_texts.iter().any(|t| text.contains(t.as_str()))
            }
        };

        let mut container_present = false;
        let mut items_with_content = 0;
        for container in document.select(&self.container) {
            container_present = true;
            items_with_content += container
                .select(&self.item)
                .filter(|item| item.text().any(|t| !t.trim().is_empty()))
                .count();
        }

        Observation {
            terminal_negative,
            container_present,
            items_with_content,
        }
    }
}

/// Result of inspecting one DOM snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub terminal_negative: bool,
    pub container_present: bool,
    pub items_with_content: usize,
}

impl Observation {
    /// Container present with at least one non-empty item
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.container_present && self.items_with_content > 0
    }
}

/// Outcome of one polling call.
///
/// Every count is the number of DOM checks made, the immediate check
/// before any delay included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Found { attempts: u32, items: usize },
    /// The page explicitly reported no data
    Absent { checks: u32 },
    /// Attempts exhausted without a decision
    NotFound { attempts: u32 },
}

impl PollOutcome {
    #[must_use]
    pub fn has_data(&self) -> bool {
        matches!(self, Self::Found { .. })
    }

    /// Site confirmed there is nothing to extract
    #[must_use]
    pub fn is_confirmed_empty(&self) -> bool {
        matches!(self, Self::Absent { .. })
    }

    /// Worth another pass in a later run
    #[must_use]
    pub fn is_undetermined(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Running totals across calls, used to judge preset tuning
#[derive(Debug, Default)]
pub struct PollingMetrics {
    calls: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    confirmed_empty: AtomicU64,
}

/// Point-in-time copy of [`PollingMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PollingMetricsSnapshot {
    pub calls: u64,
    pub attempts: u64,
    pub successes: u64,
    pub confirmed_empty: u64,
}

impl PollingMetricsSnapshot {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.successes as f64 / self.calls as f64
    }

    #[must_use]
    pub fn average_attempts(&self) -> f64 {
        if self.calls == 0 {
            return 0.0;
        }
        self.attempts as f64 / self.calls as f64
    }
}

impl PollingMetrics {
    fn record(&self, outcome: &PollOutcome) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match outcome {
            PollOutcome::Found { attempts, .. } => {
                self.attempts.fetch_add(u64::from(*attempts), Ordering::Relaxed);
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            PollOutcome::Absent { checks } => {
                self.attempts.fetch_add(u64::from(*checks), Ordering::Relaxed);
                self.confirmed_empty.fetch_add(1, Ordering::Relaxed);
            }
            PollOutcome::NotFound { attempts } => {
                self.attempts.fetch_add(u64::from(*attempts), Ordering::Relaxed);
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PollingMetricsSnapshot {
        PollingMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            confirmed_empty: self.confirmed_empty.load(Ordering::Relaxed),
        }
    }
}

/// Polls a page until its content renders, the page declares itself empty,
/// or the strategy's attempts run out
#[derive(Debug, Default)]
pub struct AdaptivePollingDetector {
    strategy: PollingStrategy,
    metrics: PollingMetrics,
}

impl AdaptivePollingDetector {
    #[must_use]
    pub fn new(strategy: PollingStrategy) -> Self {
        Self {
            strategy,
            metrics: PollingMetrics::default(),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> &PollingStrategy {
        &self.strategy
    }

    #[must_use]
    pub fn metrics(&self) -> PollingMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn observe(&self, page: &dyn PageDriver, probe: &ContentProbe) -> DriverResult<Observation> {
        let html = with_timeout(page.content(), self.strategy.check_timeout, "DOM snapshot").await?;
        Ok(probe.inspect(&html))
    }

    /// Wait for `probe` to be satisfied on `page`.
    ///
    /// Driver failures (page closed, disconnected) are returned as errors;
    /// content that never renders is `Ok(PollOutcome::NotFound)`.
    pub async fn wait_for_content(
        &self,
        page: &dyn PageDriver,
        probe: &ContentProbe,
    ) -> DriverResult<PollOutcome> {
        let outcome = self.poll(page, probe).await?;
        self.metrics.record(&outcome);
        debug!(page = page.id(), ?outcome, "Polling finished");
        Ok(outcome)
    }

    async fn poll(&self, page: &dyn PageDriver, probe: &ContentProbe) -> DriverResult<PollOutcome> {
        let mut checks = 1;
        let mut observation = self.observe(page, probe).await?;

        for delay in self.strategy.delay_schedule() {
            if let Some(outcome) = Self::decide(&observation, checks) {
                return Ok(outcome);
            }
            debug!(page = page.id(), checks, "Content not rendered yet");
            tokio::time::sleep(delay).await;
            checks += 1;
            observation = self.observe(page, probe).await?;
        }

        Ok(Self::decide(&observation, checks).unwrap_or(PollOutcome::NotFound { attempts: checks }))
    }

    /// Loaded content wins over an empty-state marker seen in the same DOM
    fn decide(observation: &Observation, checks: u32) -> Option<PollOutcome> {
        if observation.is_loaded() {
            return Some(PollOutcome::Found {
                attempts: checks,
                items: observation.items_with_content,
            });
        }
        if observation.terminal_negative {
            return Some(PollOutcome::Absent { checks });
        }
        None
    }
}
