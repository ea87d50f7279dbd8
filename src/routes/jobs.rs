use actix_web::{HttpResponse, Responder, post, web};
use serde::Serialize;

use super::{ErrorResponse, invalid_argument};
use crate::queue::JobQueue;
use crate::target::safe_relative_path;
use crate::task::{JobRequest, Mode};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub job_id: i64,
    pub judge_record_id: i64,
}

fn validate(request: &JobRequest) -> Result<(), String> {
    if request.judge_script.trim().is_empty() {
        return Err("judgeScript must not be empty".to_string());
    }
    if request.mode == Mode::Audit && request.expected_score.is_none() {
        return Err("expectedScore is required in audit mode".to_string());
    }
    for path in request.fs_snapshot.keys() {
        safe_relative_path(path).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[post("/jobs")]
pub async fn post_jobs_handler(
    queue: web::Data<JobQueue>,
    body: web::Json<JobRequest>,
) -> impl Responder {
    let request = body.into_inner();
    if let Err(message) = validate(&request) {
        log::debug!("Rejected job for record {}: {message}", request.judge_record_id);
        return invalid_argument(message);
    }

    match queue.enqueue(&request).await {
        Ok(job_id) => {
            log::info!(
                "Queued job {job_id} for record {} ({:?} mode)",
                request.judge_record_id,
                request.mode
            );
            HttpResponse::Ok().json(EnqueueResponse {
                job_id,
                judge_record_id: request.judge_record_id,
            })
        }
        Err(e) => {
            log::error!("Failed to enqueue record {}: {e}", request.judge_record_id);
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}
