//! chromiumoxide implementation of the driver traits

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    BrowserDriver, BrowserLauncher, DriverError, DriverResult, NavigateOptions, NavigationInfo,
    PageDriver, WaitUntil,
};
use crate::browser_profile::{PROFILE_PREFIX, cleanup_stale_profiles_in, create_unique_profile_in};
use crate::utils::constants::STALE_PROFILE_MIN_AGE_SECS;
use crate::browser_setup::{LaunchSettings, apply_stealth_measures, launch_browser};
use crate::scrape_engine::page_timeout::with_timeout;

/// Reads the main document's status from the Navigation Timing API
const STATUS_SCRIPT: &str =
    "(() => { const e = performance.getEntriesByType('navigation')[0]; return e && e.responseStatus ? e.responseStatus : 0; })()";

/// Quiet window appended to `WaitUntil::NetworkIdle` navigations
const NETWORK_IDLE_GRACE: Duration = Duration::from_millis(500);

/// Liveness probe timeout
const ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// One Chromium tab
#[derive(Debug, Clone)]
pub struct ChromiumPage {
    page: Page,
    id: String,
    closed: Arc<AtomicBool>,
}

impl ChromiumPage {
    fn new(page: Page) -> Self {
        let id: &str = page.target_id().as_ref();
        Self {
            id: id.to_string(),
            page,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriverError::PageClosed(format!("page {} already closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for ChromiumPage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, options: &NavigateOptions) -> DriverResult<NavigationInfo> {
        self.ensure_open()?;
        url::Url::parse(url).map_err(|e| DriverError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        with_timeout(
            async {
                self.page
                    .goto(url)
                    .await
                    .map_err(|e| DriverError::from_message(url, e.to_string()))?;
                if options.wait_until == WaitUntil::NetworkIdle {
                    self.page
                        .wait_for_navigation()
                        .await
                        .map_err(|e| DriverError::from_message(url, e.to_string()))?;
                    tokio::time::sleep(NETWORK_IDLE_GRACE).await;
                }
                Ok(())
            },
            options.timeout,
            &format!("navigation to {url}"),
        )
        .await?;

        let status = self
            .evaluate(STATUS_SCRIPT)
            .await
            .ok()
            .and_then(|v| v.as_u64())
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(0);

        if let Some(err) = DriverError::from_status(url, status) {
            return Err(err);
        }

        let final_url = self
            .page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        Ok(NavigationInfo {
            url: final_url,
            status,
        })
    }

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        self.ensure_open()?;
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| match DriverError::from_message("", e.to_string()) {
                DriverError::Other(msg) => DriverError::Script(msg),
                other => other,
            })?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn content(&self) -> DriverResult<String> {
        self.ensure_open()?;
        self.page
            .content()
            .await
            .map_err(|e| DriverError::from_message("", e.to_string()))
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        matches!(
            tokio::time::timeout(ALIVE_TIMEOUT, self.page.evaluate("1")).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) -> DriverResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| DriverError::from_message("", e.to_string()))
    }
}

/// A launched Chromium process
#[derive(Debug)]
pub struct ChromiumBrowser {
    browser: RwLock<Browser>,
    pid: Option<u32>,
    handler: parking_lot::Mutex<Option<JoinHandle<()>>>,
    user_data_dir: parking_lot::Mutex<Option<PathBuf>>,
    stealth: bool,
}

impl ChromiumBrowser {
    pub fn new(mut browser: Browser, handler: JoinHandle<()>, user_data_dir: PathBuf, stealth: bool) -> Self {
        let pid = browser.get_mut_child().and_then(|child| child.as_mut_inner().id());
        Self {
            browser: RwLock::new(browser),
            pid,
            handler: parking_lot::Mutex::new(Some(handler)),
            user_data_dir: parking_lot::Mutex::new(Some(user_data_dir)),
            stealth,
        }
    }

    fn cleanup_profile_dir(&self) {
        if let Some(path) = self.user_data_dir.lock().take() {
            debug!("Removing browser profile directory {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to remove profile directory {}: {}", path.display(), e);
            }
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromiumBrowser {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn new_page(&self) -> DriverResult<Arc<dyn PageDriver>> {
        let page = self
            .browser
            .read()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::from_message("about:blank", e.to_string()))?;

        if self.stealth
            && let Err(e) = apply_stealth_measures(&page).await
        {
            warn!("Failed to apply stealth measures: {e}");
        }

        Ok(Arc::new(ChromiumPage::new(page)))
    }

    async fn open_page_ids(&self) -> DriverResult<Vec<String>> {
        let pages = self
            .browser
            .read()
            .await
            .pages()
            .await
            .map_err(|e| DriverError::from_message("", e.to_string()))?;
        Ok(pages
            .iter()
            .map(|p| {
                let id: &str = p.target_id().as_ref();
                id.to_string()
            })
            .collect())
    }

    async fn close_page(&self, id: &str) -> DriverResult<()> {
        let pages = self
            .browser
            .read()
            .await
            .pages()
            .await
            .map_err(|e| DriverError::from_message("", e.to_string()))?;
        for page in pages {
            let target: &str = page.target_id().as_ref();
            if target == id {
                return page
                    .close()
                    .await
                    .map_err(|e| DriverError::from_message("", e.to_string()));
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let browser = self.browser.read().await;
        matches!(
            tokio::time::timeout(ALIVE_TIMEOUT, browser.version()).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) -> DriverResult<()> {
        let mut browser = self.browser.write().await;
        let mut failure = None;

        if let Err(e) = browser.close().await {
            warn!("Failed to close browser: {e}");
            failure = Some(DriverError::Disconnected(e.to_string()));
        }
        if let Err(e) = browser.wait().await {
            warn!("Failed to wait for browser exit: {e}");
        }
        drop(browser);

        // Abort the handler only after the process is gone
        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }
        self.cleanup_profile_dir();

        failure.map_or(Ok(()), Err)
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }
        self.cleanup_profile_dir();
    }
}

/// Launches a fresh Chromium with its own profile directory.
///
/// The first launch also sweeps profile directories that crashed runs left
/// under the profile root.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    settings: LaunchSettings,
    stealth: bool,
    profile_root: PathBuf,
    stale_profile_age: Duration,
    swept: Arc<AtomicBool>,
}

impl Default for ChromiumLauncher {
    fn default() -> Self {
        Self::new(LaunchSettings::default())
    }
}

impl ChromiumLauncher {
    #[must_use]
    pub fn new(settings: LaunchSettings) -> Self {
        Self {
            settings,
            stealth: true,
            profile_root: std::env::temp_dir(),
            stale_profile_age: Duration::from_secs(STALE_PROFILE_MIN_AGE_SECS),
            swept: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_stealth(mut self, stealth: bool) -> Self {
        self.stealth = stealth;
        self
    }

    /// Directory that holds per-launch profiles (default: the temp dir)
    #[must_use]
    pub fn with_profile_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.profile_root = root.into();
        self
    }

    #[must_use]
    pub fn with_stale_profile_age(mut self, age: Duration) -> Self {
        self.stale_profile_age = age;
        self
    }

    /// Remove stale profiles once per launcher; later calls return 0
    pub fn sweep_stale_profiles(&self) -> usize {
        if self.swept.swap(true, Ordering::AcqRel) {
            return 0;
        }
        match cleanup_stale_profiles_in(&self.profile_root, self.stale_profile_age) {
            Ok(cleaned) => cleaned,
            Err(e) => {
                warn!("Stale profile sweep failed: {e:#}");
                0
            }
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> DriverResult<Arc<dyn BrowserDriver>> {
        self.sweep_stale_profiles();
        let profile = create_unique_profile_in(&self.profile_root, PROFILE_PREFIX)
            .map_err(|e| DriverError::Launch(format!("{e:#}")))?;

        let (browser, handler) = launch_browser(&self.settings, profile.path())
            .await
            .map_err(|e| DriverError::Launch(format!("{e:#}")))?;

        info!("Chromium launched");
        Ok(Arc::new(ChromiumBrowser::new(
            browser,
            handler,
            profile.into_path(),
            self.stealth,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_profiles_swept_once() {
        let root = tempfile::TempDir::new().unwrap();
        let leftover = root.path().join(format!("{PROFILE_PREFIX}_crashed"));
        std::fs::create_dir(&leftover).unwrap();
        std::fs::create_dir(root.path().join("keep")).unwrap();

        let launcher = ChromiumLauncher::default()
            .with_profile_root(root.path())
            .with_stale_profile_age(Duration::ZERO);
        assert_eq!(launcher.sweep_stale_profiles(), 1);
        assert!(!leftover.exists());
        assert!(root.path().join("keep").exists());

        // Clones share the sweep flag
        std::fs::create_dir(&leftover).unwrap();
        assert_eq!(launcher.clone().sweep_stale_profiles(), 0);
        assert!(leftover.exists());
    }

    #[test]
    fn test_recent_profiles_survive_default_age() {
        let root = tempfile::TempDir::new().unwrap();
        let live = root.path().join(format!("{PROFILE_PREFIX}_live"));
        std::fs::create_dir(&live).unwrap();

        let launcher = ChromiumLauncher::default().with_profile_root(root.path());
        assert_eq!(launcher.sweep_stale_profiles(), 0);
        assert!(live.exists());
    }
}
