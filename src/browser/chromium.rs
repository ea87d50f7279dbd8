use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{BrowserError, BrowserHandle, BrowserLauncher, PageHandle};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

fn page_error(e: impl std::fmt::Display) -> BrowserError {
    BrowserError::Page(e.to_string())
}

/// Launches headless Chromium processes driven over the DevTools protocol
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
}

impl ChromiumLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        let driver = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::warn!("Browser event loop stopped: {e}");
                    break;
                }
            }
        });

        log::info!("Launched headless browser");
        Ok(Arc::new(ChromiumBrowser {
            browser: Arc::new(Mutex::new(browser)),
            driver,
        }))
    }
}

struct ChromiumBrowser {
    browser: Arc<Mutex<Browser>>,
    driver: JoinHandle<()>,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn is_alive(&self) -> bool {
        if self.driver.is_finished() {
            return false;
        }
        let browser = self.browser.lock().await;
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, browser.version()).await,
            Ok(Ok(_))
        )
    }

    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        let browser = self.browser.lock().await;
        let context = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(page_error)?
            .result
            .browser_context_id;

        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context.clone())
            .build()
            .map_err(BrowserError::Page)?;

        let page = match browser.new_page(params).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser
                    .execute(DisposeBrowserContextParams::new(context))
                    .await;
                return Err(page_error(e));
            }
        };

        Ok(Box::new(ChromiumPage {
            page,
            context,
            browser: Arc::clone(&self.browser),
        }))
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            log::debug!("Closing browser failed: {e}");
        }
        let _ = browser.wait().await;
        self.driver.abort();
    }
}

struct ChromiumPage {
    page: Page,
    context: BrowserContextId,
    browser: Arc<Mutex<Browser>>,
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.page.goto(url).await.map_err(page_error)?;
        Ok(())
    }

    async fn url(&self) -> Result<Option<String>, BrowserError> {
        self.page.url().await.map_err(page_error)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(page_error)
    }

    async fn content(&self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(page_error)
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self.page.evaluate(expression).await.map_err(page_error)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn inner_text(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        match self.page.find_element(selector).await {
            Ok(element) => element.inner_text().await.map_err(page_error),
            Err(_) => Ok(None),
        }
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.page
            .find_element(selector)
            .await
            .map_err(page_error)?
            .click()
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let closed = self.page.clone().close().await.map_err(page_error);
        let disposed = self
            .browser
            .lock()
            .await
            .execute(DisposeBrowserContextParams::new(self.context.clone()))
            .await
            .map(|_| ())
            .map_err(page_error);
        closed.and(disposed)
    }
}
