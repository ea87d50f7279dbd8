use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::judge::JobProcessor;
use crate::queue::{JobQueue, JobReport, QueueEvent};

/// Pause after a failed claim before asking the queue again
pub const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

pub async fn worker(
    id: u8,
    queue: Arc<JobQueue>,
    processor: Arc<dyn JobProcessor>,
    events: mpsc::Sender<QueueEvent>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            claimed = queue.next() => {
                let job = match claimed {
                    Ok(job) => job,
                    Err(e) => {
                        log::error!("Worker {id} failed to claim a job: {e}");
                        emit(&events, QueueEvent::Error(JobReport {
                            judge_record_id: None,
                            job_id: None,
                            status: None,
                            message: e.to_string(),
                        })).await;
                        tokio::select! {
                            _ = token.cancelled() => {
                                log::info!("Worker {id} received shutdown signal, stopping");
                                break;
                            }
                            _ = tokio::time::sleep(CLAIM_RETRY_DELAY) => {}
                        }
                        continue;
                    }
                };
                let job_id = job.job_id;
                let record_id = job.request.judge_record_id;
                log::info!("Worker {id} got job {job_id} (record {record_id}) from queue");

                // A panicking processor only fails its own job
                let processor = Arc::clone(&processor);
                let handle = tokio::spawn(async move { processor.process(&job).await });

                let event = match handle.await {
                    Ok(Ok(verdict)) => {
                        log::info!(
                            "Job {job_id} finished on worker {id}: {} with score {}",
                            verdict.status.as_str(),
                            verdict.total_score
                        );
                        QueueEvent::Completed(JobReport {
                            judge_record_id: Some(record_id),
                            job_id: Some(job_id),
                            status: Some(verdict.status),
                            message: String::new(),
                        })
                    }
                    Ok(Err(e)) => QueueEvent::Failed(JobReport {
                        judge_record_id: Some(record_id),
                        job_id: Some(job_id),
                        status: None,
                        message: format!("{e:#}"),
                    }),
                    Err(e) => {
                        log::error!("Job {job_id} panicked on worker {id}: {e}");
                        QueueEvent::Failed(JobReport {
                            judge_record_id: Some(record_id),
                            job_id: Some(job_id),
                            status: None,
                            message: format!("processor panicked: {e}"),
                        })
                    }
                };

                let event = match queue.finish(job_id).await {
                    Ok(()) => event,
                    Err(e) => {
                        log::error!("Failed to remove job {job_id} from queue: {e}");
                        QueueEvent::Error(JobReport {
                            judge_record_id: Some(record_id),
                            job_id: Some(job_id),
                            status: None,
                            message: e.to_string(),
                        })
                    }
                };
                emit(&events, event).await;
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

async fn emit(events: &mpsc::Sender<QueueEvent>, event: QueueEvent) {
    if events.send(event).await.is_err() {
        log::warn!("Result dispatcher is gone, dropping event");
    }
}
