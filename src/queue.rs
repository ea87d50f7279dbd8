//! Durable FIFO of judge jobs backed by the `queue_jobs` table.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tokio::sync::Notify;

use crate::create_timestamp;
use crate::task::{CheckStatus, JobRequest};

// Fallback wake-up in case a notification was missed
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode job payload: {0}")]
    Encode(serde_json::Error),
    #[error("job {job_id} has an unreadable payload: {source}")]
    Corrupt {
        job_id: i64,
        source: serde_json::Error,
    },
}

/// A job owned by exactly one worker until it is finished
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job_id: i64,
    pub queued_at: String,
    /// Deliveries interrupted by a restart before this one
    pub attempts: u32,
    pub request: JobRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub judge_record_id: Option<i64>,
    pub job_id: Option<i64>,
    /// Verdict of a completed job
    pub status: Option<CheckStatus>,
    pub message: String,
}

/// Terminal state of a job, consumed by the result dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Completed(JobReport),
    Failed(JobReport),
    Error(JobReport),
}

impl QueueEvent {
    pub fn report(&self) -> &JobReport {
        match self {
            Self::Completed(report) | Self::Failed(report) | Self::Error(report) => report,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Error(_) => "error",
        }
    }
}

pub struct JobQueue {
    pool: SqlitePool,
    notify: Notify,
}

impl JobQueue {
    /// The table is created by [`crate::database::init_db`]
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            notify: Notify::new(),
        })
    }

    pub async fn enqueue(&self, request: &JobRequest) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(request).map_err(QueueError::Encode)?;
        let now = create_timestamp();

        let result = sqlx::query(
            r"
            INSERT INTO queue_jobs (judge_record_id, payload, state, attempts, queued_at, updated_at)
            VALUES (?, ?, 'waiting', 0, ?, ?)
            ",
        )
        .bind(request.judge_record_id)
        .bind(payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let job_id = result.last_insert_rowid();
        log::debug!(
            "Enqueued job {job_id} for record {}",
            request.judge_record_id
        );
        self.notify.notify_one();
        Ok(job_id)
    }

    /// Takes the oldest waiting job, if any
    pub async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let row = sqlx::query(
            r"
            UPDATE queue_jobs SET state = 'active', updated_at = ?
            WHERE id = (SELECT id FROM queue_jobs WHERE state = 'waiting' ORDER BY id LIMIT 1)
            RETURNING id, payload, attempts, queued_at
            ",
        )
        .bind(create_timestamp())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job_id: i64 = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;

        let request = match serde_json::from_str::<JobRequest>(&payload) {
            Ok(request) => request,
            Err(source) => {
                // Redelivering a payload that can never be decoded would loop forever
                self.finish(job_id).await?;
                return Err(QueueError::Corrupt { job_id, source });
            }
        };

        Ok(Some(ClaimedJob {
            job_id,
            queued_at: row.try_get("queued_at")?,
            attempts: row.try_get::<i64, _>("attempts")?.try_into().unwrap_or(u32::MAX),
            request,
        }))
    }

    /// Waits until a job can be claimed
    pub async fn next(&self) -> Result<ClaimedJob, QueueError> {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.claim().await? {
                return Ok(job);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Removes a job that reached a terminal state
    pub async fn finish(&self, job_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Puts jobs left active by a previous process back in line
    pub async fn recover(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r"
            UPDATE queue_jobs SET state = 'waiting', attempts = attempts + 1, updated_at = ?
            WHERE state = 'active'
            ",
        )
        .bind(create_timestamp())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            log::warn!("Recovered {recovered} interrupted jobs");
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    /// Number of waiting jobs
    pub async fn len(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_jobs WHERE state = 'waiting'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.try_into().unwrap_or_default())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}
