//! The shared connection between the coordinator and the sandbox service.
//!
//! All workers send tasks over one connection. Replies come back in any order
//! and are routed to the waiting worker by `judgeRecordId`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::task::{JudgeReply, Task};

/// Literal heartbeat frame exchanged on the channel
pub const HEARTBEAT: &[u8] = b"ping";

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn is_heartbeat(frame: &[u8]) -> bool {
    frame == HEARTBEAT
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("sandbox service is not connected")]
    NotConnected,
    #[error("no reply from sandbox service within {0:?}")]
    Timeout(Duration),
    #[error("record {0} is already awaiting a reply")]
    AlreadyInFlight(i64),
    #[error("failed to send task: {0}")]
    Send(String),
}

/// Sends tasks to the sandbox service
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Registers a waiter for the task's reply, then sends the task
    async fn send(&self, task: &Task) -> Result<PendingReply, DispatchError>;
}

/// Outstanding replies keyed by record id; each entry is claimed at most once.
#[derive(Default)]
pub struct PendingReplies {
    waiters: Mutex<HashMap<i64, Waiter>>,
    tickets: AtomicU64,
}

struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<JudgeReply>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter; dropping the returned handle deregisters it
    pub fn register(self: &Arc<Self>, record_id: i64) -> Result<PendingReply, DispatchError> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(&record_id) {
            return Err(DispatchError::AlreadyInFlight(record_id));
        }
        let (tx, rx) = oneshot::channel();
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        waiters.insert(record_id, Waiter { ticket, tx });
        Ok(PendingReply {
            pending: Arc::clone(self),
            record_id,
            ticket,
            rx,
        })
    }

    /// Delivers a reply to its waiter. Returns `false` when nobody is waiting
    pub fn resolve(&self, reply: JudgeReply) -> bool {
        let record_id = reply.judge_record_id;
        let Some(waiter) = self.waiters.lock().remove(&record_id) else {
            log::debug!("Dropping reply for record {record_id}: no waiter registered");
            return false;
        };
        waiter.tx.send(reply).is_ok()
    }

    /// Drops every waiter so they fail with `NotConnected` right away
    pub fn fail_all(&self) -> usize {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        waiters.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered waiter for one record's reply
pub struct PendingReply {
    pending: Arc<PendingReplies>,
    record_id: i64,
    ticket: u64,
    rx: oneshot::Receiver<JudgeReply>,
}

impl PendingReply {
    pub fn record_id(&self) -> i64 {
        self.record_id
    }

    /// Waits for the reply; on timeout the waiter is gone and a late reply is dropped
    pub async fn wait(mut self, timeout: Duration) -> Result<JudgeReply, DispatchError> {
        let result = tokio::time::timeout(timeout, &mut self.rx).await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DispatchError::NotConnected),
            Err(_) => Err(DispatchError::Timeout(timeout)),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        let mut waiters = self.pending.waiters.lock();
        // The entry may already belong to a newer registration for the same id
        if waiters
            .get(&self.record_id)
            .is_some_and(|w| w.ticket == self.ticket)
        {
            waiters.remove(&self.record_id);
        }
    }
}

/// Coordinator-side client of the sandbox service.
///
/// A background task keeps one TCP connection alive, reconnecting after a
/// fixed interval. Dispatching while disconnected fails immediately.
pub struct SandboxClient {
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    pending: Arc<PendingReplies>,
}

impl SandboxClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outbound: Mutex::new(None),
            pending: Arc::new(PendingReplies::new()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn pending(&self) -> &Arc<PendingReplies> {
        &self.pending
    }

    /// Maintains the connection to `address` until `token` is cancelled
    pub async fn run(self: Arc<Self>, address: String, retry: Duration, token: CancellationToken) {
        loop {
            match TcpStream::connect(&address).await {
                Ok(stream) => {
                    log::info!("Connected to sandbox service at {address}");
                    self.drive(stream, &token).await;
                    *self.outbound.lock() = None;
                    let abandoned = self.pending.fail_all();
                    log::warn!(
                        "Disconnected from sandbox service at {address}, {abandoned} replies abandoned"
                    );
                }
                Err(e) => {
                    log::debug!("Sandbox service at {address} unreachable: {e}");
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }
        log::info!("Sandbox client stopped");
    }

    async fn drive(&self, stream: TcpStream, token: &CancellationToken) {
        let (mut sink, mut frames) = Framed::new(stream, frame_codec()).split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        *self.outbound.lock() = Some(tx);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(frame) = rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        log::error!("Failed to write to sandbox service: {e}");
                        break;
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(&frame),
                    Some(Err(e)) => {
                        log::error!("Failed to read from sandbox service: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }
    }

    fn on_frame(&self, frame: &[u8]) {
        if is_heartbeat(frame) {
            log::trace!("Heartbeat from sandbox service");
            return;
        }
        match JudgeReply::decode(frame) {
            Ok(reply) => {
                self.pending.resolve(reply);
            }
            Err(e) => log::error!("Undecodable frame from sandbox service: {e}"),
        }
    }
}

#[async_trait]
impl TaskDispatcher for SandboxClient {
    async fn send(&self, task: &Task) -> Result<PendingReply, DispatchError> {
        let Some(tx) = self.outbound.lock().clone() else {
            return Err(DispatchError::NotConnected);
        };
        if tx.is_closed() {
            return Err(DispatchError::NotConnected);
        }
        let frame = serde_json::to_vec(task).map_err(|e| DispatchError::Send(e.to_string()))?;

        // Register first so a fast reply cannot arrive before its waiter
        let pending = self.pending.register(task.judge_record_id)?;
        tx.send(Bytes::from(frame))
            .await
            .map_err(|_| DispatchError::NotConnected)?;
        Ok(pending)
    }
}
