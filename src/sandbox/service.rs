use std::time::Instant;

use anyhow::Context;
use tokio_util::bytes::Bytes;

use super::runtime::ScriptRuntime;
use crate::browser::BrowserPool;
use crate::task::{JudgeOutcome, JudgeReply, JudgeSummary, Task, peek_record_id};

const NAVIGATION_RETRIES: u32 = 3;

/// Turns task requests into judge replies.
pub struct SandboxService {
    pool: BrowserPool,
    runtime: ScriptRuntime,
}

impl SandboxService {
    pub fn new(pool: BrowserPool, runtime: ScriptRuntime) -> Self {
        Self { pool, runtime }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    /// Handles one raw request frame and returns the encoded reply frame
    pub async fn handle_frame(&self, raw: &[u8]) -> Bytes {
        let reply = self.handle_request(raw).await;
        match reply.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode reply for record {}: {e}", reply.judge_record_id);
                let fallback = JudgeReply::error(
                    reply.judge_record_id,
                    reply.judge_time,
                    format!("failed to encode result: {e}"),
                );
                // An error reply holds no binary data and always encodes
                fallback.encode().unwrap_or_default()
            }
        }
    }

    /// Validates and executes a task; every failure becomes an `Error` reply
    pub async fn handle_request(&self, raw: &[u8]) -> JudgeReply {
        let started = Instant::now();
        let elapsed = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let task = match Task::parse(raw) {
            Ok(task) => task,
            Err(e) => {
                let record_id = peek_record_id(raw).unwrap_or_default();
                log::warn!("Rejected malformed task for record {record_id}: {e}");
                return JudgeReply::error(record_id, elapsed(), e.to_string());
            }
        };

        log::info!("Judging record {} in {:?} mode", task.judge_record_id, task.mode);
        let outcome = match self.judge(&task).await {
            Ok(summary) => JudgeOutcome::Done(summary),
            Err(e) => {
                log::warn!("Record {} failed to judge: {e:#}", task.judge_record_id);
                JudgeOutcome::Error {
                    message: format!("{e:#}"),
                }
            }
        };

        JudgeReply {
            judge_record_id: task.judge_record_id,
            judge_time: elapsed(),
            outcome,
        }
    }

    async fn judge(&self, task: &Task) -> anyhow::Result<JudgeSummary> {
        let page = self
            .pool
            .open_page(&task.url, NAVIGATION_RETRIES)
            .await
            .with_context(|| format!("cannot open {}", task.url))?;
        let handle = page.handle();

        let first_screen = match handle.screenshot().await {
            Ok(screen) => Some(screen),
            Err(e) => {
                log::debug!("No first screen for record {}: {e}", task.judge_record_id);
                None
            }
        };

        let results = self.runtime.run(task, handle).await;
        page.close().await;

        Ok(JudgeSummary::from_results(results?, first_screen))
    }
}
