//! The single browser process pages are drawn from

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::PoolError;
use crate::driver::{BrowserDriver, BrowserLauncher};

/// Owns one browser incarnation at a time
pub struct BrowserProcess {
    launcher: Arc<dyn BrowserLauncher>,
    browser: RwLock<Option<Arc<dyn BrowserDriver>>>,
    launches: AtomicU64,
}

impl std::fmt::Debug for BrowserProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserProcess")
            .field("launches", &self.launches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BrowserProcess {
    #[must_use]
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            browser: RwLock::new(None),
            launches: AtomicU64::new(0),
        }
    }

    /// Launch if not already running
    pub async fn launch(&self) -> Result<(), PoolError> {
        let mut slot = self.browser.write().await;
        if slot.is_some() {
            debug!("Browser already running, launch skipped");
            return Ok(());
        }
        *slot = Some(self.launch_locked().await?);
        Ok(())
    }

    /// Close the current browser (if any) and launch a new one
    pub async fn relaunch(&self) -> Result<(), PoolError> {
        let mut slot = self.browser.write().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.close().await {
                warn!("Closing previous browser failed: {e}");
            }
        }
        *slot = Some(self.launch_locked().await?);
        Ok(())
    }

    async fn launch_locked(&self) -> Result<Arc<dyn BrowserDriver>, PoolError> {
        let browser = self.launcher.launch().await.map_err(PoolError::Launch)?;
        let n = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Browser process launched (launch #{n})");
        Ok(browser)
    }

    pub async fn close(&self) {
        if let Some(browser) = self.browser.write().await.take() {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {e}");
            }
            info!("Browser process closed");
        }
    }

    /// The running browser
    pub async fn browser(&self) -> Result<Arc<dyn BrowserDriver>, PoolError> {
        self.browser.read().await.clone().ok_or(PoolError::NotRunning)
    }

    /// Main process pid of the running browser
    pub async fn pid(&self) -> Option<u32> {
        self.browser.read().await.as_ref().and_then(|b| b.pid())
    }

    pub async fn is_running(&self) -> bool {
        self.browser.read().await.is_some()
    }

    #[must_use]
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }
}
