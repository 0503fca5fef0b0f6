//! Scripted in-memory browser for the fixture_sync test suite
//!
//! `FakeLauncher` hands out `FakeBrowser`s that all share one `FakeWorld`.
//! The world holds the script: HTML served per URL, URLs whose navigation
//! fails, and counters the tests assert on.

#![allow(dead_code)]

use async_trait::async_trait;
use fixture_sync::driver::{
    BrowserDriver, BrowserLauncher, DriverError, DriverResult, NavigateOptions, NavigationInfo,
    PageDriver,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub const DEFAULT_HTML: &str = "<html><head><title>blank</title></head><body></body></html>";

/// Script and counters shared by every browser a launcher creates
#[derive(Debug, Default)]
pub struct FakeWorld {
    pages_by_url: parking_lot::Mutex<HashMap<String, String>>,
    /// Successive `content()` results for a URL, consumed front to back.
    /// The last one repeats once the queue has a single item.
    content_sequences: parking_lot::Mutex<HashMap<String, VecDeque<String>>>,
    failures: parking_lot::Mutex<HashMap<String, DriverError>>,
    script_results: parking_lot::Mutex<HashMap<String, serde_json::Value>>,
    navigation_delay: parking_lot::Mutex<Option<Duration>>,
    fail_launch: AtomicBool,
    fail_new_page: AtomicBool,
    next_page: AtomicU64,
    pub launches: AtomicUsize,
    pub pages_created: AtomicUsize,
    pub pages_closed: AtomicUsize,
    pub navigations: AtomicUsize,
    pub content_reads: AtomicUsize,
    browsers: parking_lot::Mutex<Vec<Arc<FakeBrowser>>>,
}

impl FakeWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, html: &str) {
        self.pages_by_url.lock().insert(url.to_string(), html.to_string());
    }

    pub fn serve_sequence(&self, url: &str, htmls: &[&str]) {
        self.content_sequences
            .lock()
            .insert(url.to_string(), htmls.iter().map(|h| (*h).to_string()).collect());
    }

    pub fn fail(&self, url: &str, error: DriverError) {
        self.failures.lock().insert(url.to_string(), error);
    }

    /// Value `evaluate` returns for `script`; unscripted evaluations yield `true`
    pub fn script_result(&self, script: &str, value: serde_json::Value) {
        self.script_results.lock().insert(script.to_string(), value);
    }

    pub fn clear_failure(&self, url: &str) {
        self.failures.lock().remove(url);
    }

    pub fn set_navigation_delay(&self, delay: Duration) {
        *self.navigation_delay.lock() = Some(delay);
    }

    pub fn set_fail_launch(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_new_page(&self, fail: bool) {
        self.fail_new_page.store(fail, Ordering::SeqCst);
    }

    /// Most recently launched browser
    pub fn current_browser(&self) -> Arc<FakeBrowser> {
        Arc::clone(self.browsers.lock().last().expect("no browser launched"))
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    fn html_for(&self, url: &str) -> String {
        if let Some(queue) = self.content_sequences.lock().get_mut(url) {
            if queue.len() > 1 {
                if let Some(next) = queue.pop_front() {
                    return next;
                }
            }
            if let Some(last) = queue.front() {
                return last.clone();
            }
        }
        self.pages_by_url
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTML.to_string())
    }
}

#[derive(Debug)]
pub struct FakePage {
    id: String,
    world: Arc<FakeWorld>,
    alive: AtomicBool,
    current_url: parking_lot::Mutex<String>,
}

impl FakePage {
    /// Simulate a crashed tab: `is_alive` turns false
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive_now(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn current_url(&self) -> String {
        self.current_url.lock().clone()
    }
}

#[async_trait]
impl PageDriver for FakePage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, _options: &NavigateOptions) -> DriverResult<NavigationInfo> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::PageClosed(self.id.clone()));
        }
        let delay = *self.world.navigation_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.world.navigations.fetch_add(1, Ordering::SeqCst);
        let failure = self.world.failures.lock().get(url).cloned();
        if let Some(error) = failure {
            return Err(error);
        }
        *self.current_url.lock() = url.to_string();
        Ok(NavigationInfo {
            url: url.to_string(),
            status: 200,
        })
    }

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::PageClosed(self.id.clone()));
        }
        Ok(self
            .world
            .script_results
            .lock()
            .get(script)
            .cloned()
            .unwrap_or(serde_json::Value::Bool(true)))
    }

    async fn content(&self) -> DriverResult<String> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::PageClosed(self.id.clone()));
        }
        self.world.content_reads.fetch_add(1, Ordering::SeqCst);
        let url = self.current_url();
        Ok(self.world.html_for(&url))
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> DriverResult<()> {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.world.pages_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeBrowser {
    /// 1000 + launch number
    pub pid: u32,
    world: Arc<FakeWorld>,
    pages: parking_lot::Mutex<HashMap<String, Arc<FakePage>>>,
    connected: AtomicBool,
}

impl FakeBrowser {
    fn create_page(&self) -> Arc<FakePage> {
        let n = self.world.next_page.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(FakePage {
            id: format!("page-{n}"),
            world: Arc::clone(&self.world),
            alive: AtomicBool::new(true),
            current_url: parking_lot::Mutex::new("about:blank".to_string()),
        });
        self.world.pages_created.fetch_add(1, Ordering::SeqCst);
        self.pages.lock().insert(page.id.clone(), Arc::clone(&page));
        page
    }

    /// Open a tab the pool knows nothing about
    pub fn open_untracked_page(&self) -> Arc<FakePage> {
        self.create_page()
    }

    pub fn page(&self, id: &str) -> Option<Arc<FakePage>> {
        self.pages.lock().get(id).cloned()
    }

    /// Tabs not yet closed
    pub fn live_page_count(&self) -> usize {
        self.pages
            .lock()
            .values()
            .filter(|p| p.alive.load(Ordering::SeqCst))
            .count()
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn new_page(&self) -> DriverResult<Arc<dyn PageDriver>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DriverError::Disconnected("fake browser closed".into()));
        }
        if self.world.fail_new_page.load(Ordering::SeqCst) {
            return Err(DriverError::Other("new_page scripted to fail".into()));
        }
        Ok(self.create_page())
    }

    async fn open_page_ids(&self) -> DriverResult<Vec<String>> {
        Ok(self
            .pages
            .lock()
            .values()
            .filter(|p| p.alive.load(Ordering::SeqCst))
            .map(|p| p.id.clone())
            .collect())
    }

    async fn close_page(&self, id: &str) -> DriverResult<()> {
        let page = self.pages.lock().get(id).cloned();
        match page {
            Some(page) => page.close().await,
            None => Err(DriverError::PageClosed(id.to_string())),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> DriverResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        let pages: Vec<_> = self.pages.lock().values().cloned().collect();
        for page in pages {
            page.close().await?;
        }
        Ok(())
    }
}

/// Launcher that creates `FakeBrowser`s bound to one world
#[derive(Debug, Clone)]
pub struct FakeLauncher {
    pub world: Arc<FakeWorld>,
}

impl FakeLauncher {
    pub fn new() -> (Arc<Self>, Arc<FakeWorld>) {
        let world = FakeWorld::new();
        (
            Arc::new(Self {
                world: Arc::clone(&world),
            }),
            world,
        )
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> DriverResult<Arc<dyn BrowserDriver>> {
        if self.world.fail_launch.load(Ordering::SeqCst) {
            return Err(DriverError::Launch("launch scripted to fail".into()));
        }
        let launch = self.world.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let browser = Arc::new(FakeBrowser {
            pid: 1000 + launch as u32,
            world: Arc::clone(&self.world),
            pages: parking_lot::Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        });
        self.world.browsers.lock().push(Arc::clone(&browser));
        Ok(browser)
    }
}

/// HTML fixture with a fixtures table of `rows` rows
pub fn fixtures_html(rows: usize) -> String {
    let body: String = (0..rows)
        .map(|i| format!(r#"<tr class="fixture-row" data-fixture-id="{i}"><td>Team {i}</td></tr>"#))
        .collect();
    format!(
        r#"<html><head><title>Fixtures</title></head><body>
<div id="fixtures" class="fixtures-container" data-season="2026">
<table class="fixtures">{body}</table>
</div>
<a href="/ladder">Ladder</a>
</body></html>"#
    )
}

/// HTML fixture whose container says there is nothing to show
pub fn empty_fixtures_html() -> &'static str {
    r#"<html><head><title>Fixtures</title></head><body>
<div id="fixtures" class="fixtures-container" data-season="2026">
<p class="no-data">No fixtures available</p>
</div>
</body></html>"#
}
