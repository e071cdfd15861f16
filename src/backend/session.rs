//! Framed JSON-RPC session over a backend's stdio streams.
//!
//! The session owns two long-lived tasks:
//!
//! ```text
//! sync/feature calls ─► mpsc::Sender<Bytes> ─► writer task ─► child stdin
//! child stdout ─► reader task ─► FrameCodec ─► pending map / tracing
//! ```
//!
//! Concurrent callers never touch the output stream directly; every outbound
//! frame goes through the writer task's channel, so frames cannot interleave
//! on the wire. Responses are routed back through a pending map of `oneshot`
//! senders keyed by request id. Every request carries a deadline; on expiry
//! the pending entry is abandoned and the eventual response (if any) is
//! discarded by the reader.
//!
//! The session is generic over `AsyncRead`/`AsyncWrite`, so tests drive it
//! over `tokio::io::duplex` with a scripted peer instead of a real process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::protocol::FrameCodec;
use crate::rpc::{Inbound, RpcNotification, RpcRequest, RpcResponse};

/// Outbound channel capacity.
const CHANNEL_CAPACITY: usize = 256;

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<RpcResponse>>>>;

/// A live framed JSON-RPC session.
///
/// Cheap to share behind an `Arc`; dropped oneshot senders and an atomic
/// `broken` flag keep callers degrading instead of hanging once the peer
/// goes away.
pub struct RpcSession {
    /// Channel into the writer task.
    tx: mpsc::Sender<Bytes>,
    /// Requests awaiting a response.
    pending: PendingMap,
    /// Next request id.
    next_id: AtomicI64,
    /// Set when either task observes the peer going away.
    broken: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl RpcSession {
    /// Start a session over the given streams, spawning both tasks.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let broken = Arc::new(AtomicBool::new(false));

        let writer_task = tokio::spawn(writer_loop(rx, writer, broken.clone()));
        let reader_task = tokio::spawn(reader_loop(reader, pending.clone(), broken.clone()));

        Self {
            tx,
            pending,
            next_id: AtomicI64::new(1),
            broken,
            reader_task,
            writer_task,
        }
    }

    /// Whether the peer is known to be gone.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Send a notification (fire-and-forget).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if self.is_broken() {
            return Err(BridgeError::SessionClosed);
        }
        let payload = serde_json::to_value(RpcNotification::new(method, params))?;
        self.send_frame(&payload).await
    }

    /// Send a request and await its response, bounded by `deadline`.
    ///
    /// Returns `Ok(Some(result))` on success and `Ok(None)` when the backend
    /// answered with an error object (logged, not propagated). Transport
    /// failures and deadline expiry surface as `Err`; on expiry the pending
    /// entry is dropped and any late response is discarded.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Option<Value>> {
        if self.is_broken() {
            return Err(BridgeError::SessionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = serde_json::to_value(RpcRequest::new(id, method, params))?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, response_tx);

        if let Err(e) = self.send_frame(&payload).await {
            self.pending.lock().expect("pending map poisoned").remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(deadline, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(BridgeError::SessionClosed),
            Err(_) => {
                // Abandon the request; the reader drops the late response.
                self.pending.lock().expect("pending map poisoned").remove(&id);
                return Err(BridgeError::Timeout);
            }
        };

        if let Some(error) = response.error {
            tracing::debug!(method, code = error.code, "backend returned error: {}", error.message);
            return Ok(None);
        }
        Ok(Some(response.result.unwrap_or(Value::Null)))
    }

    /// Tear the session down, ending both tasks.
    ///
    /// Idempotent; pending requests observe `SessionClosed`.
    pub fn shutdown(&self) {
        self.broken.store(true, Ordering::Release);
        self.reader_task.abort();
        self.writer_task.abort();
        self.pending.lock().expect("pending map poisoned").clear();
    }

    async fn send_frame(&self, payload: &Value) -> Result<()> {
        let bytes = FrameCodec::encode_message(payload);
        self.tx
            .send(bytes)
            .await
            .map_err(|_| BridgeError::SessionClosed)
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Writer loop - drains the channel onto the peer's input stream.
async fn writer_loop<W>(mut rx: mpsc::Receiver<Bytes>, mut writer: W, broken: Arc<AtomicBool>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            tracing::warn!("backend write failed: {}", e);
            broken.store(true, Ordering::Release);
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!("backend flush failed: {}", e);
            broken.store(true, Ordering::Release);
            return;
        }
    }
}

/// Reader loop - parses frames off the peer's output stream and routes them.
async fn reader_loop<R>(mut reader: R, pending: PendingMap, broken: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("backend closed its output stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("backend read failed: {}", e);
                break;
            }
        };

        let payloads = match codec.push(&buf[..n]) {
            Ok(payloads) => payloads,
            Err(e) => {
                tracing::error!("backend framing error: {}", e);
                break;
            }
        };

        for payload in payloads {
            route_inbound(payload, &pending);
        }
    }

    broken.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with SessionClosed.
    pending.lock().expect("pending map poisoned").clear();
}

fn route_inbound(payload: Value, pending: &PendingMap) {
    match Inbound::classify(payload) {
        Inbound::Response(response) => {
            let waiter = pending
                .lock()
                .expect("pending map poisoned")
                .remove(&response.id);
            match waiter {
                Some(tx) => {
                    // Send fails only if the request already timed out.
                    let _ = tx.send(response);
                }
                None => tracing::debug!(id = response.id, "dropping late backend response"),
            }
        }
        Inbound::Notification(notification) => {
            tracing::debug!(method = %notification.method, "ignoring backend notification");
        }
        Inbound::Other(payload) => {
            tracing::warn!("unexpected backend payload: {}", payload);
        }
    }
}
