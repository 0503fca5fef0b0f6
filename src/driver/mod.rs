//! Browser automation driver boundary
//!
//! The engine needs only a handful of capabilities from the automation library:
//! open a page, navigate it, evaluate scripts, read its HTML and close it.
//! [`BrowserDriver`] and [`PageDriver`] capture exactly that, so pools and
//! runners can be exercised without a real Chromium and the chromiumoxide
//! adapter in [`chromium`] stays the only code that touches CDP.

pub mod chromium;
pub mod error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub use chromium::{ChromiumBrowser, ChromiumLauncher, ChromiumPage};
pub use error::{DriverError, DriverResult, ErrorClass};

/// When a navigation counts as finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitUntil {
    /// `load` event fired
    #[default]
    Load,
    /// `DOMContentLoaded` fired
    DomContentLoaded,
    /// Load plus no network activity for a short window
    NetworkIdle,
}

/// Options for [`PageDriver::navigate`]
#[derive(Debug, Clone)]
pub struct NavigateOptions {
    pub timeout: Duration,
    pub wait_until: WaitUntil,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::utils::constants::DEFAULT_NAVIGATION_TIMEOUT_SECS),
            wait_until: WaitUntil::Load,
        }
    }
}

/// What a successful navigation produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationInfo {
    /// Final URL after redirects
    pub url: String,
    /// HTTP status of the main document, 0 when unknown
    pub status: u16,
}

/// Options for [`PageDriver::wait_for_condition`]
#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// A named extraction script evaluated in the page.
///
/// The script must evaluate to a JSON-serializable value; site-specific
/// selectors live in the script, not in the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProbe {
    pub name: String,
    pub script: String,
}

impl PageProbe {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
        }
    }

    /// Deserialize a value produced by [`PageDriver::extract`]
    pub fn decode<T: serde::de::DeserializeOwned>(&self, value: serde_json::Value) -> DriverResult<T> {
        serde_json::from_value(value)
            .map_err(|e| DriverError::Script(format!("probe {} returned unexpected shape: {e}", self.name)))
    }
}

/// A single browser tab
#[async_trait]
pub trait PageDriver: Send + Sync + std::fmt::Debug {
    /// Stable identifier of the underlying target
    fn id(&self) -> &str;

    /// Navigate and wait according to `options`
    async fn navigate(&self, url: &str, options: &NavigateOptions) -> DriverResult<NavigationInfo>;

    /// Evaluate a JavaScript expression and return its JSON value.
    ///
    /// Site-specific extraction is expressed as scripts passed here.
    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value>;

    /// Current serialized DOM
    async fn content(&self) -> DriverResult<String>;

    /// Whether the page still answers commands
    async fn is_alive(&self) -> bool;

    /// Close the tab
    async fn close(&self) -> DriverResult<()>;

    /// Run a site-specific extraction probe
    async fn extract(&self, probe: &PageProbe) -> DriverResult<serde_json::Value> {
        self.evaluate(&probe.script).await
    }

    /// Poll `predicate` (a JS expression) until it is truthy or the timeout expires
    async fn wait_for_condition(&self, predicate: &str, options: WaitOptions) -> DriverResult<bool> {
        let deadline = tokio::time::Instant::now() + options.timeout;
        loop {
            let value = self.evaluate(predicate).await?;
            if is_truthy(&value) {
                return Ok(true);
            }
            if tokio::time::Instant::now() + options.poll_interval > deadline {
                return Ok(false);
            }
            tokio::time::sleep(options.poll_interval).await;
        }
    }
}

/// A running browser process
#[async_trait]
pub trait BrowserDriver: Send + Sync + std::fmt::Debug {
    /// Open a blank tab
    async fn new_page(&self) -> DriverResult<Arc<dyn PageDriver>>;

    /// OS pid of the browser's main process, when this driver spawned it
    fn pid(&self) -> Option<u32> {
        None
    }

    /// Identifiers of every tab the browser currently has open
    async fn open_page_ids(&self) -> DriverResult<Vec<String>>;

    /// Close a tab that nothing in the engine holds a handle to
    async fn close_page(&self, id: &str) -> DriverResult<()>;

    /// Whether the CDP connection is still usable
    async fn is_connected(&self) -> bool;

    /// Shut the process down
    async fn close(&self) -> DriverResult<()>;
}

/// Launches browser processes; called again on every restart
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> DriverResult<Arc<dyn BrowserDriver>>;
}

/// JavaScript truthiness for evaluation results
#[must_use]
pub fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}
