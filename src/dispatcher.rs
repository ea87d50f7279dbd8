use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::WebhookConfig;
use crate::queue::QueueEvent;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Tells the web application that a record reached a terminal state.
///
/// One GET per event, never retried. Delivery failures are only logged.
pub struct ResultDispatcher {
    client: reqwest::Client,
    url: Option<String>,
    token: String,
}

impl ResultDispatcher {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(CALLBACK_TIMEOUT).build()?;
        if config.url.is_none() {
            log::warn!("No webhook url configured, results will not be announced");
        }
        Ok(Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
        })
    }

    /// Consumes events until every sender is dropped
    pub async fn run(self, mut events: mpsc::Receiver<QueueEvent>) {
        while let Some(event) = events.recv().await {
            self.notify(&event).await;
        }
        log::info!("Result dispatcher stopped");
    }

    pub async fn notify(&self, event: &QueueEvent) {
        let report = event.report();
        let Some(record_id) = report.judge_record_id else {
            log::error!("Queue error without a record: {}", report.message);
            return;
        };
        let Some(url) = &self.url else {
            return;
        };

        let record = record_id.to_string();
        let result = self
            .client
            .get(url)
            .query(&[("token", self.token.as_str()), ("recordId", record.as_str())])
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => log::debug!("Announced {} record {record_id}", event.kind()),
            Err(e) => log::warn!("Failed to announce record {record_id}: {e}"),
        }
    }
}
