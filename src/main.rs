use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use webjudge::browser::{BrowserPool, ChromiumLauncher};
use webjudge::channel::SandboxClient;
use webjudge::config::{CliArgs, Command, Config};
use webjudge::database::{self as db, SqliteRecordStore};
use webjudge::dispatcher::ResultDispatcher;
use webjudge::judge::{JobProcessor, JudgeProcessor};
use webjudge::queue::JobQueue;
use webjudge::sandbox::{
    HttpReferenceLoader, RuntimeLimits, SandboxService, ScriptRuntime, serve,
};
use webjudge::storage::LocalArtifactStore;
use webjudge::target::{DockerCli, TargetOrchestrator};
use webjudge::web_server::build_server;
use webjudge::worker::worker;

const EVENT_BUFFER: usize = 256;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;

    match cli.command {
        Command::Coordinator { flush_data } => run_coordinator(config, flush_data).await,
        Command::Sandbox => run_sandbox(config).await,
    }
}

async fn run_coordinator(config: Config, flush_data: bool) -> anyhow::Result<()> {
    let Config {
        server: server_config,
        queue: queue_config,
        target: target_config,
        sandbox: sandbox_config,
        webhook: webhook_config,
        storage: storage_config,
    } = config;

    if queue_config.workers == 0 {
        bail!("The number of workers must not be 0");
    }

    let db_path = match queue_config.database_path {
        Some(path) => path,
        None => db::get_db_path()?,
    };
    if flush_data {
        db::remove_db(&db_path);
    }
    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;

    let job_queue = JobQueue::new(db_pool.clone());
    job_queue
        .recover()
        .await
        .context("Failed to recover interrupted jobs")?;

    let artifact_dir = match storage_config.artifact_dir {
        Some(dir) => dir,
        None => LocalArtifactStore::default_dir()?,
    };
    let artifacts = Arc::new(LocalArtifactStore::new(
        artifact_dir,
        storage_config.public_base_url,
    )?);
    let records = Arc::new(SqliteRecordStore::new(db_pool));

    let targets = Arc::new(TargetOrchestrator::new(
        Arc::new(DockerCli::default()),
        target_config,
    ));
    targets
        .init()
        .await
        .context("Failed to prepare the internal network")?;

    let shutdown_token = CancellationToken::new();
    let sandbox_client = SandboxClient::new();
    let client_task = tokio::spawn(Arc::clone(&sandbox_client).run(
        sandbox_config.address.clone(),
        sandbox_config.reconnect_interval.into(),
        shutdown_token.clone(),
    ));

    let processor: Arc<dyn JobProcessor> = Arc::new(JudgeProcessor::new(
        Arc::clone(&targets),
        sandbox_client,
        artifacts.clone(),
        records,
        sandbox_config.reply_timeout.into(),
    ));

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let dispatcher_task = tokio::spawn(ResultDispatcher::new(&webhook_config)?.run(events_rx));

    // ======= PREPARATION END, EXECUTION START =======

    let mut workers = JoinSet::new();
    for i in 1..=queue_config.workers {
        workers.spawn(worker(
            i,
            job_queue.clone(),
            processor.clone(),
            events_tx.clone(),
            shutdown_token.clone(),
        ));
    }
    drop(events_tx);

    let server = build_server(server_config, job_queue, artifacts).context("Failed to build server")?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {:?}", res_worker);
        }
    }

    // 1. Stop accepting submissions
    server_handle.stop(true).await;

    // 2. Broadcast shutdown signal to workers and the sandbox client
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(Err(e)) => log::error!("Worker finished with error: {e:#}"),
            Err(e) if e.is_panic() => log::error!("Worker handle panicked: {:?}", e),
            Err(e) => log::error!("Worker handle finished with error: {:?}", e),
            Ok(Ok(())) => {}
        }
    }

    // 4. Every sender is gone, so the dispatcher drains and stops
    if let Err(e) = dispatcher_task.await {
        log::error!("Result dispatcher failed: {e}");
    }
    if let Err(e) = client_task.await {
        log::error!("Sandbox client failed: {e}");
    }

    if let Err(e) = targets.teardown().await {
        log::warn!("Failed to remove internal network: {e:#}");
    }

    log::info!("Shutdown complete");
    Ok(())
}

async fn run_sandbox(config: Config) -> anyhow::Result<()> {
    let sandbox_config = config.sandbox;
    if sandbox_config.pool_size == 0 || sandbox_config.max_pages == 0 {
        bail!("Browser pool size and page limit must not be 0");
    }

    let launcher = Arc::new(ChromiumLauncher::new(sandbox_config.chrome_executable.clone()));
    let pool = BrowserPool::new(launcher, sandbox_config.pool_size, sandbox_config.max_pages);
    pool.heal().await;

    let reply_timeout: Duration = sandbox_config.reply_timeout.into();
    let references = Arc::new(HttpReferenceLoader::new(reply_timeout)?);
    let limits = RuntimeLimits {
        script_timeout: sandbox_config.script_timeout.into(),
        image_cap: sandbox_config.image_cap.0,
        ..RuntimeLimits::default()
    };
    let service = Arc::new(SandboxService::new(
        pool.clone(),
        ScriptRuntime::new(limits, references),
    ));

    let listener = TcpListener::bind(&sandbox_config.address)
        .await
        .with_context(|| format!("Failed to bind {}", sandbox_config.address))?;
    let shutdown_token = CancellationToken::new();
    let mut server_task = tokio::spawn(serve(
        listener,
        service,
        sandbox_config.heartbeat_interval.into(),
        shutdown_token.clone(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res = &mut server_task => {
            log::error!("Sandbox service terminated unexpectedly: {:?}", res);
        }
    }

    shutdown_token.cancel();
    if !server_task.is_finished() {
        match server_task.await {
            Ok(Err(e)) => log::error!("Sandbox service failed: {e:#}"),
            Err(e) => log::error!("Sandbox service task failed: {e}"),
            Ok(Ok(())) => {}
        }
    }
    pool.destroy().await;

    log::info!("Shutdown complete");
    Ok(())
}
