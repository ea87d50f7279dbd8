use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::queue::JobQueue;
use crate::routes::{get_artifact_handler, json_error_handler, post_jobs_handler};
use crate::storage::LocalArtifactStore;

// Snapshots carry whole projects, allow more than the default 32 KiB
const JSON_LIMIT: usize = 32 * 1024 * 1024;

pub fn build_server(
    server_config: ServerConfig,
    queue: Arc<JobQueue>,
    artifacts: Arc<LocalArtifactStore>,
) -> std::io::Result<Server> {
    let queue = web::Data::from(queue);
    let artifacts = web::Data::from(artifacts);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(queue.clone())
            .app_data(artifacts.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(JSON_LIMIT)
                    .error_handler(json_error_handler),
            )
            .wrap(middleware::Logger::default())
            .service(post_jobs_handler)
            .service(get_artifact_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
