use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use super::{BrowserError, BrowserHandle, BrowserLauncher, PageHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotStatus {
    Alive,
    Dead,
}

struct Slot {
    browser: Arc<dyn BrowserHandle>,
    status: SlotStatus,
}

struct PoolInner {
    launcher: Arc<dyn BrowserLauncher>,
    size: usize,
    slots: Mutex<Vec<Slot>>,
    /// Bounds the number of simultaneously open pages across all slots
    pages: Arc<Semaphore>,
    healing: AtomicBool,
    destroyed: AtomicBool,
}

/// Fixed-size pool of browser processes that repairs dead slots lazily.
///
/// Slot indices are stable: a dead slot is replaced in place, never removed,
/// so an index handed out by [`BrowserPool::pick_alive_browser`] keeps
/// referring to the same position.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

fn same_browser(a: &Arc<dyn BrowserHandle>, b: &Arc<dyn BrowserHandle>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, size: usize, max_pages: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                size: size.max(1),
                slots: Mutex::new(Vec::new()),
                pages: Arc::new(Semaphore::new(max_pages.max(1))),
                healing: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn status(&self, index: usize) -> Option<SlotStatus> {
        self.inner.slots.lock().await.get(index).map(|s| s.status)
    }

    /// Returns the first slot believed alive, launching one if the pool is empty.
    ///
    /// Dead slots are repaired in the background without blocking the caller.
    pub async fn pick_alive_browser(
        &self,
    ) -> Result<(usize, Arc<dyn BrowserHandle>), BrowserError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(BrowserError::Destroyed);
        }

        let mut slots = self.inner.slots.lock().await;
        if slots.is_empty() {
            let browser = self.inner.launcher.launch().await?;
            slots.push(Slot {
                browser: Arc::clone(&browser),
                status: SlotStatus::Alive,
            });
            drop(slots);
            if self.inner.size > 1 {
                self.spawn_heal();
            }
            return Ok((0, browser));
        }

        let picked = slots
            .iter()
            .position(|s| s.status == SlotStatus::Alive)
            .map(|i| (i, Arc::clone(&slots[i].browser)));
        drop(slots);

        self.spawn_heal();

        match picked {
            Some(pick) => Ok(pick),
            None => {
                log::warn!("No live browser in pool, restarting slot 0");
                self.restart(0).await.map(|browser| (0, browser))
            }
        }
    }

    /// Opens `url` in a fresh isolated page, retrying up to `max_retries` times.
    ///
    /// A failed attempt health-checks the slot it used and marks it dead when
    /// the browser no longer responds, so the next attempt picks another one.
    pub async fn open_page(&self, url: &str, max_retries: u32) -> Result<PooledPage, BrowserError> {
        let permit = Arc::clone(&self.inner.pages)
            .acquire_owned()
            .await
            .map_err(|_| BrowserError::Destroyed)?;

        let mut remaining = max_retries;
        loop {
            let (index, browser) = self.pick_alive_browser().await?;

            match Self::navigate(&browser, url).await {
                Ok(page) => {
                    return Ok(PooledPage {
                        page: Arc::from(page),
                        closed: false,
                        _permit: permit,
                    });
                }
                Err(e) => {
                    log::warn!("Opening {url} on browser slot {index} failed: {e}");
                    if !browser.is_alive().await {
                        self.mark_dead(&browser).await;
                    }
                    if remaining == 0 {
                        return Err(BrowserError::Navigation {
                            url: url.to_string(),
                            attempts: max_retries + 1,
                            reason: e.to_string(),
                        });
                    }
                    remaining -= 1;
                }
            }
        }
    }

    async fn navigate(
        browser: &Arc<dyn BrowserHandle>,
        url: &str,
    ) -> Result<Box<dyn PageHandle>, BrowserError> {
        let page = browser.new_page().await?;
        if let Err(e) = page.goto(url).await {
            if let Err(close_err) = page.close().await {
                log::debug!("Closing page after failed navigation failed: {close_err}");
            }
            return Err(e);
        }
        Ok(page)
    }

    /// Force-replaces the browser at `index`
    pub async fn restart(&self, index: usize) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(BrowserError::Destroyed);
        }
        if index >= self.inner.slots.lock().await.len() {
            return Err(BrowserError::NoSlot(index));
        }

        let fresh = self.inner.launcher.launch().await?;
        let old = {
            let mut slots = self.inner.slots.lock().await;
            let slot = slots.get_mut(index).ok_or(BrowserError::NoSlot(index))?;
            slot.status = SlotStatus::Alive;
            std::mem::replace(&mut slot.browser, Arc::clone(&fresh))
        };
        old.close().await;

        log::info!("Browser slot {index} restarted");
        Ok(fresh)
    }

    /// Closes every browser and empties the pool; later calls fail with `Destroyed`
    pub async fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.pages.close();

        let slots = std::mem::take(&mut *self.inner.slots.lock().await);
        for slot in slots {
            slot.browser.close().await;
        }
        log::info!("Browser pool destroyed");
    }

    async fn mark_dead(&self, browser: &Arc<dyn BrowserHandle>) {
        let mut slots = self.inner.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| same_browser(&s.browser, browser)) {
            slot.status = SlotStatus::Dead;
        }
        drop(slots);
        browser.close().await;
    }

    fn spawn_heal(&self) {
        if self.inner.healing.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            pool.heal().await;
            pool.inner.healing.store(false, Ordering::Release);
        });
    }

    /// Health-checks every slot, replaces dead ones and fills the pool up to size
    pub async fn heal(&self) {
        let snapshot: Vec<(usize, Arc<dyn BrowserHandle>, SlotStatus)> = self
            .inner
            .slots
            .lock()
            .await
            .iter()
            .enumerate()
            .map(|(i, s)| (i, Arc::clone(&s.browser), s.status))
            .collect();

        for (index, browser, status) in snapshot {
            if self.inner.destroyed.load(Ordering::Acquire) {
                return;
            }
            if status == SlotStatus::Alive && browser.is_alive().await {
                continue;
            }
            log::warn!("Browser slot {index} is dead, replacing it");
            self.mark_dead(&browser).await;
            if let Err(e) = self.replace_if_unchanged(index, &browser).await {
                log::error!("Failed to replace browser slot {index}: {e}");
            }
        }

        while !self.inner.destroyed.load(Ordering::Acquire)
            && self.inner.slots.lock().await.len() < self.inner.size
        {
            match self.inner.launcher.launch().await {
                Ok(browser) => {
                    let mut slots = self.inner.slots.lock().await;
                    if slots.len() < self.inner.size {
                        slots.push(Slot {
                            browser,
                            status: SlotStatus::Alive,
                        });
                    } else {
                        drop(slots);
                        browser.close().await;
                    }
                }
                Err(e) => {
                    log::error!("Failed to grow browser pool: {e}");
                    break;
                }
            }
        }
    }

    async fn replace_if_unchanged(
        &self,
        index: usize,
        dead: &Arc<dyn BrowserHandle>,
    ) -> Result<(), BrowserError> {
        let fresh = self.inner.launcher.launch().await?;
        let mut slots = self.inner.slots.lock().await;
        match slots.get_mut(index) {
            Some(slot) if same_browser(&slot.browser, dead) => {
                slot.browser = fresh;
                slot.status = SlotStatus::Alive;
            }
            _ => {
                drop(slots);
                fresh.close().await;
            }
        }
        Ok(())
    }
}

/// A page checked out of the pool; holds one page permit until closed.
pub struct PooledPage {
    page: Arc<dyn PageHandle>,
    closed: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledPage {
    pub fn handle(&self) -> Arc<dyn PageHandle> {
        Arc::clone(&self.page)
    }

    /// Closes both the page and its browsing context
    pub async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.page.close().await {
            log::warn!("Failed to close page: {e}");
        }
    }
}

impl Drop for PooledPage {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let page = Arc::clone(&self.page);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    struct FakePage;

    #[async_trait]
    impl PageHandle for FakePage {
        async fn goto(&self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn url(&self) -> Result<Option<String>, BrowserError> {
            Ok(None)
        }
        async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
            Ok(Vec::new())
        }
        async fn content(&self) -> Result<String, BrowserError> {
            Ok(String::new())
        }
        async fn evaluate(&self, _e: &str) -> Result<serde_json::Value, BrowserError> {
            Ok(serde_json::Value::Null)
        }
        async fn inner_text(&self, _s: &str) -> Result<Option<String>, BrowserError> {
            Ok(None)
        }
        async fn click(&self, _s: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    struct FakeBrowser {
        alive: AtomicBool,
    }

    #[async_trait]
    impl BrowserHandle for FakeBrowser {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(Box::new(FakePage))
            } else {
                Err(BrowserError::Page("target closed".into()))
            }
        }
        async fn close(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: AtomicUsize,
        browsers: parking_lot::Mutex<Vec<Arc<FakeBrowser>>>,
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            let browser = Arc::new(FakeBrowser {
                alive: AtomicBool::new(true),
            });
            self.browsers.lock().push(Arc::clone(&browser));
            Ok(browser)
        }
    }

    #[tokio::test]
    async fn test_first_pick_launches_browser() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(launcher.clone(), 1, 4);

        let (index, _) = pool.pick_alive_browser().await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(pool.len().await, 1);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_page_recovers_from_dead_slot() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(launcher.clone(), 1, 4);
        pool.pick_alive_browser().await.unwrap();

        // Kill the only browser behind the pool's back
        launcher.browsers.lock()[0].alive.store(false, Ordering::SeqCst);

        let page = pool.open_page("http://target:8080", 3).await.unwrap();
        page.close().await;

        assert_eq!(pool.status(0).await, Some(SlotStatus::Alive));
        assert!(launcher.launched.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_restart_replaces_slot() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(launcher.clone(), 1, 4);
        let (_, before) = pool.pick_alive_browser().await.unwrap();

        let after = pool.restart(0).await.unwrap();
        assert!(!same_browser(&before, &after));
        assert!(!before.is_alive().await);
        assert!(matches!(pool.restart(5).await, Err(BrowserError::NoSlot(5))));
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(launcher.clone(), 1, 4);
        let (_, browser) = pool.pick_alive_browser().await.unwrap();

        pool.destroy().await;
        assert!(!browser.is_alive().await);
        assert!(pool.is_empty().await);
        assert!(matches!(
            pool.open_page("http://target:8080", 0).await,
            Err(BrowserError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_heal_fills_pool_to_size() {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(launcher.clone(), 3, 4);
        pool.pick_alive_browser().await.unwrap();
        pool.heal().await;
        assert_eq!(pool.len().await, 3);
    }
}
