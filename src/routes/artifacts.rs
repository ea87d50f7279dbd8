use actix_web::{HttpResponse, Responder, get, web};

use super::ErrorResponse;
use crate::storage::LocalArtifactStore;

fn content_type(id: &str) -> &'static str {
    let lower = id.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

/// Serves stored artifacts so the sandbox can load audit references
#[get("/artifacts/{id}")]
pub async fn get_artifact_handler(
    store: web::Data<LocalArtifactStore>,
    id: web::Path<String>,
) -> impl Responder {
    let not_found = || {
        HttpResponse::NotFound().json(ErrorResponse {
            reason: "ERR_NOT_FOUND",
            code: 3,
        })
    };

    let Some(path) = store.path_of(&id) else {
        return not_found();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => HttpResponse::Ok()
            .content_type(content_type(&id))
            .body(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found(),
        Err(e) => {
            log::error!("Failed to read artifact {}: {e}", path.display());
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}
