//! Runs one job end to end: target, sandbox round trip, persistence, cleanup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channel::TaskDispatcher;
use crate::database::{JudgeRecord, RecordStore, StoredCheckPoint};
use crate::queue::ClaimedJob;
use crate::storage::ArtifactStore;
use crate::target::{EphemeralTarget, TargetOrchestrator};
use crate::task::{CheckStatus, JudgeOutcome, JudgeSummary, Mode, Task};

// Scores are sums of floats; equal within this margin counts as equal
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeStage {
    Queued,
    TargetStarting,
    Dispatched,
    AwaitingResult,
    Persisting,
    Completed,
    Failed,
}

impl fmt::Display for JudgeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JudgeStage::Queued => "Queued",
            JudgeStage::TargetStarting => "TargetStarting",
            JudgeStage::Dispatched => "Dispatched",
            JudgeStage::AwaitingResult => "AwaitingResult",
            JudgeStage::Persisting => "Persisting",
            JudgeStage::Completed => "Completed",
            JudgeStage::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Logs every transition of one record
struct StageLog {
    record_id: i64,
    stage: JudgeStage,
}

impl StageLog {
    fn new(record_id: i64) -> Self {
        log::debug!("Record {record_id}: {}", JudgeStage::Queued);
        Self {
            record_id,
            stage: JudgeStage::Queued,
        }
    }

    fn enter(&mut self, stage: JudgeStage) {
        log::debug!("Record {}: {} -> {stage}", self.record_id, self.stage);
        self.stage = stage;
    }
}

/// Result of a job that reached `Completed`
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub judge_record_id: i64,
    pub status: CheckStatus,
    pub total_score: f64,
    /// False when a redelivered job overwrote an existing record
    pub first_finalisation: bool,
}

/// What a worker runs for each claimed job
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &ClaimedJob) -> anyhow::Result<Verdict>;
}

pub struct JudgeProcessor {
    targets: Arc<TargetOrchestrator>,
    dispatcher: Arc<dyn TaskDispatcher>,
    artifacts: Arc<dyn ArtifactStore>,
    records: Arc<dyn RecordStore>,
    reply_timeout: Duration,
}

impl JudgeProcessor {
    pub fn new(
        targets: Arc<TargetOrchestrator>,
        dispatcher: Arc<dyn TaskDispatcher>,
        artifacts: Arc<dyn ArtifactStore>,
        records: Arc<dyn RecordStore>,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            targets,
            dispatcher,
            artifacts,
            records,
            reply_timeout,
        }
    }

    async fn run(&self, job: &ClaimedJob, stages: &mut StageLog) -> anyhow::Result<Verdict> {
        let request = &job.request;
        let info = match request.mode {
            Mode::Audit => None,
            Mode::Judge => Some(
                self.records
                    .references(request.problem_id)
                    .await
                    .context("failed to load problem references")?,
            ),
        };

        stages.enter(JudgeStage::TargetStarting);
        let target = self
            .targets
            .start(request.judge_record_id, &request.fs_snapshot)
            .await?;

        let outcome = self.judge_on(&target, job, info, stages).await;
        target.close().await;
        outcome
    }

    async fn judge_on(
        &self,
        target: &EphemeralTarget,
        job: &ClaimedJob,
        info: Option<HashMap<String, String>>,
        stages: &mut StageLog,
    ) -> anyhow::Result<Verdict> {
        let request = &job.request;
        let task = Task {
            judge_record_id: request.judge_record_id,
            judge_script: request.judge_script.clone(),
            mode: request.mode,
            url: target.network_url().to_string(),
            info,
        };

        stages.enter(JudgeStage::Dispatched);
        let pending = self.dispatcher.send(&task).await?;

        stages.enter(JudgeStage::AwaitingResult);
        let reply = pending.wait(self.reply_timeout).await?;

        match reply.outcome {
            JudgeOutcome::Error { message } => bail!("sandbox reported an error: {message}"),
            JudgeOutcome::Done(summary) => {
                stages.enter(JudgeStage::Persisting);
                self.persist(job, summary, reply.judge_time)
                    .await
                    .context("failed to persist judge result")
            }
        }
    }

    async fn persist(
        &self,
        job: &ClaimedJob,
        summary: JudgeSummary,
        judge_time: u64,
    ) -> anyhow::Result<Verdict> {
        let request = &job.request;
        let record_id = request.judge_record_id;

        let mut references = HashMap::new();
        let mut results = Vec::with_capacity(summary.results.len());
        for result in summary.results {
            let mut cache_files = HashMap::new();
            for (name, bytes) in &result.cache_files {
                let id = self.artifacts.save(bytes, name).await?;
                let url = self.artifacts.url(&id);
                references.insert(name.clone(), url.clone());
                cache_files.insert(name.clone(), url);
            }
            results.push(StoredCheckPoint {
                name: result.name,
                score: result.score,
                total_score: result.total_score,
                status: result.status,
                details: result.details,
                cache_files,
            });
        }

        let first_screen = match &summary.first_screen {
            Some(bytes) => {
                let id = self
                    .artifacts
                    .save(bytes, &format!("first-screen-{record_id}.png"))
                    .await?;
                Some(self.artifacts.url(&id))
            }
            None => None,
        };

        let passed = is_passing(request.mode, &summary.status, summary.total_score, request.expected_score);
        let record = JudgeRecord {
            judge_record_id: record_id,
            problem_id: request.problem_id,
            user_id: request.user_id,
            mode: request.mode,
            passed,
            total_score: summary.total_score,
            max_score: summary.max_score,
            judge_time,
            results,
            first_screen,
            message: String::new(),
        };
        let first_finalisation = self.records.save(&record).await?;

        if request.mode == Mode::Audit && passed {
            self.records
                .replace_references(request.problem_id, &references)
                .await?;
            log::info!(
                "Problem {} now has {} reference artifacts",
                request.problem_id,
                references.len()
            );
        }

        Ok(Verdict {
            judge_record_id: record_id,
            status: if passed {
                CheckStatus::Pass
            } else {
                CheckStatus::Fail
            },
            total_score: summary.total_score,
            first_finalisation,
        })
    }
}

/// Audit runs must hit the declared score; judge runs must pass every checkpoint
pub fn is_passing(
    mode: Mode,
    status: &CheckStatus,
    total_score: f64,
    expected_score: Option<f64>,
) -> bool {
    match mode {
        Mode::Audit => expected_score.is_some_and(|expected| (total_score - expected).abs() < SCORE_EPSILON),
        Mode::Judge => *status == CheckStatus::Pass,
    }
}

fn pending_latency(queued_at: &str) -> Option<Duration> {
    let queued = DateTime::parse_from_rfc3339(queued_at).ok()?;
    (Utc::now() - queued.with_timezone(&Utc)).to_std().ok()
}

#[async_trait]
impl JobProcessor for JudgeProcessor {
    async fn process(&self, job: &ClaimedJob) -> anyhow::Result<Verdict> {
        let request = &job.request;
        let mut stages = StageLog::new(request.judge_record_id);
        if let Some(latency) = pending_latency(&job.queued_at) {
            log::debug!(
                "Record {} waited {latency:?} in queue (attempt {})",
                request.judge_record_id,
                job.attempts + 1
            );
        }

        match self.run(job, &mut stages).await {
            Ok(verdict) => {
                stages.enter(JudgeStage::Completed);
                Ok(verdict)
            }
            Err(e) => {
                stages.enter(JudgeStage::Failed);
                log::error!("Record {} failed: {e:#}", request.judge_record_id);
                let record = JudgeRecord::failed(
                    request.judge_record_id,
                    request.problem_id,
                    request.user_id,
                    request.mode,
                    format!("{e:#}"),
                );
                if let Err(save_err) = self.records.save(&record).await {
                    log::error!(
                        "Failed to record failure of {}: {save_err:#}",
                        request.judge_record_id
                    );
                }
                Err(e)
            }
        }
    }
}
