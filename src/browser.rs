mod chromium;
mod pool;

pub use chromium::ChromiumLauncher;
pub use pool::{BrowserPool, PooledPage, SlotStatus};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("page operation failed: {0}")]
    Page(String),
    #[error("opening {url} failed after {attempts} attempts: {reason}")]
    Navigation {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("no browser slot at index {0}")]
    NoSlot(usize),
    #[error("browser pool has been destroyed")]
    Destroyed,
}

/// A page living in its own isolated browsing context.
#[async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), BrowserError>;

    async fn url(&self) -> Result<Option<String>, BrowserError>;

    /// Full-page PNG screenshot
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    async fn content(&self) -> Result<String, BrowserError>;

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BrowserError>;

    /// Inner text of the first element matching `selector`, if any
    async fn inner_text(&self, selector: &str) -> Result<Option<String>, BrowserError>;

    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Closes the page together with its browsing context
    async fn close(&self) -> Result<(), BrowserError>;
}

/// One running browser process.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn is_alive(&self) -> bool;

    /// Opens a blank page inside a fresh browsing context
    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError>;

    async fn close(&self);
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError>;
}
