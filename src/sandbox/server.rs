use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::SandboxService;
use crate::channel::{HEARTBEAT, frame_codec, is_heartbeat};

/// Printed to stdout once the listener accepts connections
pub const READY_MESSAGE: &str = "Server is running";

/// Accepts coordinator connections until `token` is cancelled.
pub async fn serve(
    listener: TcpListener,
    service: Arc<SandboxService>,
    heartbeat: Duration,
    token: CancellationToken,
) -> anyhow::Result<()> {
    println!("{READY_MESSAGE}");
    log::info!("Sandbox service listening on {}", listener.local_addr()?);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                log::info!("Coordinator connected from {peer}");
                let service = Arc::clone(&service);
                let token = token.child_token();
                connections.spawn(async move {
                    handle_connection(stream, service, heartbeat, token).await;
                    log::info!("Coordinator {peer} disconnected");
                });
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    log::error!("Connection task failed: {e}");
                }
            }
        }
    }

    connections.shutdown().await;
    log::info!("Sandbox service stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<SandboxService>,
    heartbeat: Duration,
    token: CancellationToken,
) {
    let (mut sink, mut frames) = Framed::new(stream, frame_codec()).split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);

    let writer_token = token.clone();
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;
        loop {
            let frame = tokio::select! {
                _ = writer_token.cancelled() => break,
                _ = ticker.tick() => Bytes::from_static(HEARTBEAT),
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = sink.send(frame).await {
                log::error!("Failed to write to coordinator: {e}");
                writer_token.cancel();
                break;
            }
        }
    });

    let mut requests = JoinSet::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(frame)) if is_heartbeat(&frame) => {
                    log::trace!("Heartbeat from coordinator");
                }
                Some(Ok(frame)) => {
                    let service = Arc::clone(&service);
                    let tx = tx.clone();
                    requests.spawn(async move {
                        let reply = service.handle_frame(&frame).await;
                        if tx.send(reply).await.is_err() {
                            log::warn!("Connection closed before a reply could be sent");
                        }
                    });
                }
                Some(Err(e)) => {
                    log::error!("Failed to read from coordinator: {e}");
                    break;
                }
                None => break,
            },
            Some(finished) = requests.join_next(), if !requests.is_empty() => {
                if let Err(e) = finished {
                    log::error!("Request task failed: {e}");
                }
            }
        }
    }

    // In-flight tasks hold pages from the shared pool; abort them with the connection
    requests.shutdown().await;
    token.cancel();
    drop(tx);
    if let Err(e) = writer.await {
        log::error!("Writer task failed: {e}");
    }
}
