//! Line-delimited JSON-RPC 2.0 client.
//!
//! Owns a monotonically increasing id counter, a pending-response map, a
//! notification-handler map, and one writer mutex. A reader task scans
//! lines and dispatches: responses resolve their waiter, notifications are
//! handed to a single dispatcher task so the reader never blocks while
//! notification order is preserved, and server-initiated requests are
//! logged and ignored. On EOF every outstanding waiter fails with
//! [`RpcError::ConnectionClosed`].
//!
//! The client is generic over its streams, so tests drive it over
//! `tokio::io::duplex` and production wires it to a child's stdin/stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::error::RpcError;
use super::types::{Inbound, IncomingMessage, RpcNotification, RpcRequest};

/// Handler invoked with a notification's params.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;
type HandlerMap = Arc<RwLock<HashMap<String, NotificationHandler>>>;

pub struct JsonRpcClient {
    next_id: AtomicU64,
    pending: PendingMap,
    handlers: HandlerMap,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    close_signal: CancellationToken,
}

impl JsonRpcClient {
    /// Start a client over a pair of byte streams and spawn its reader.
    pub fn new(
        reader: impl AsyncRead + Unpin + Send + 'static,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let handlers: HandlerMap = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let close_signal = CancellationToken::new();

        // Single dispatcher keeps notification handlers off the reader
        // while preserving their arrival order.
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<(NotificationHandler, Value)>();
        tokio::spawn(async move {
            while let Some((handler, params)) = note_rx.recv().await {
                handler(params);
            }
        });

        let reader_handle = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            handlers.clone(),
            note_tx,
            closed.clone(),
            close_signal.clone(),
        ));

        Self {
            next_id: AtomicU64::new(1),
            pending,
            handlers,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            reader_handle: Mutex::new(Some(reader_handle)),
            closed,
            close_signal,
        }
    }

    /// Register a handler for a notification method.
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(method.into(), handler);
    }

    pub fn remove_notification_handler(&self, method: &str) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .remove(method);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response, honouring `cancel`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, tx);

        let request = RpcRequest::new(id, method, params);
        if let Err(e) = self.write_line(&request).await {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(e);
        }

        tokio::select! {
            response = rx => match response {
                Ok(result) => result,
                // Sender dropped: reader closed the pending map.
                Err(_) => Err(RpcError::ConnectionClosed),
            },
            () = cancel.cancelled() => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&id);
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Send a notification; returns as soon as the line is written.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        self.write_line(&RpcNotification::new(method, params)).await
    }

    /// Close the write side, drain the reader, and fail all waiters.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.cancel();

        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        let handle = self
            .reader_handle
            .lock()
            .expect("reader handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        fail_all_pending(&self.pending);
    }

    async fn write_line(&self, message: &impl serde::Serialize) -> Result<(), RpcError> {
        let mut line = serde_json::to_string(message).map_err(|e| RpcError::Serialize(e.to_string()))?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RpcError::Io(e.to_string()))?;
        writer.flush().await.map_err(|e| RpcError::Io(e.to_string()))
    }
}

async fn read_loop(
    reader: impl AsyncRead + Unpin + Send,
    pending: PendingMap,
    handlers: HandlerMap,
    notes: mpsc::UnboundedSender<(NotificationHandler, Value)>,
    closed: Arc<AtomicBool>,
    close_signal: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            () = close_signal.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let message: IncomingMessage = match serde_json::from_str(line) {
                    Ok(m) => m,
                    Err(e) => {
                        // Malformed lines are skipped, not fatal.
                        debug!(error = %e, "Skipping malformed RPC line");
                        continue;
                    }
                };
                if let Some(inbound) = message.classify() {
                    dispatch(inbound, &pending, &handlers, &notes);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "RPC reader error");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_all_pending(&pending);
    debug!("RPC reader exited");
}

fn dispatch(
    inbound: Inbound,
    pending: &PendingMap,
    handlers: &HandlerMap,
    notes: &mpsc::UnboundedSender<(NotificationHandler, Value)>,
) {
    match inbound {
        Inbound::Response { id, result } => {
            let waiter = pending.lock().expect("pending lock poisoned").remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(result.map_err(RpcError::from));
                }
                None => warn!(id, "Response for unknown request id"),
            }
        }
        Inbound::Notification { method, params } => {
            let handler = handlers
                .read()
                .expect("handler lock poisoned")
                .get(&method)
                .cloned();
            match handler {
                Some(handler) => {
                    let _ = notes.send((handler, params));
                }
                None => trace!(method = %method, "No handler for notification"),
            }
        }
        Inbound::ServerRequest { id, method } => {
            warn!(id, method = %method, "Ignoring server-initiated request");
        }
    }
}

fn fail_all_pending(pending: &PendingMap) {
    let waiters: Vec<_> = pending
        .lock()
        .expect("pending lock poisoned")
        .drain()
        .collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(RpcError::ConnectionClosed));
    }
}
