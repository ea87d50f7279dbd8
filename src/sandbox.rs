mod image_diff;
mod page;
mod runtime;
mod server;
mod service;
mod system;

pub use image_diff::{DEFAULT_THRESHOLD, similarity};
pub use runtime::{ENTRY_POINT, RuntimeLimits, ScriptError, ScriptRuntime};
pub use server::{READY_MESSAGE, serve};
pub use service::SandboxService;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Fetches reference artifacts recorded by earlier audit runs
#[async_trait]
pub trait ReferenceLoader: Send + Sync {
    async fn load(&self, locator: &str) -> Result<Vec<u8>>;
}

/// Loads references from the URLs the artifact store handed out
pub struct HttpReferenceLoader {
    client: reqwest::Client,
}

impl HttpReferenceLoader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ReferenceLoader for HttpReferenceLoader {
    async fn load(&self, locator: &str) -> Result<Vec<u8>> {
        let response = self.client.get(locator).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
