//! JSON-RPC over stdio transport.
//!
//! One JSON object per line in both directions. A single reader task owns
//! the process's stdout for its whole life and demultiplexes it:
//! - before the handshake completes it only looks for the `initialize` answer
//! - afterwards responses are routed by id to the waiting caller
//! - everything else (server requests, notifications, log lines, non-JSON
//!   output) is logged and dropped
//!
//! Writers share stdin behind a mutex; each message is written as one
//! complete line and flushed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::BridgeError;
use super::lifecycle::ManagedProcess;
use super::registry::Registry;
use super::types::{
    InboundMessage, InitState, JsonRpcNotification, JsonRpcRequest, RequestId,
    INITIALIZE_REQUEST_ID, PROTOCOL_VERSION,
};

type CallResult = Result<serde_json::Value, BridgeError>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Reader State ────────────────────────────────────────────────────────────

/// State shared between the transport handle and its reader task.
struct ReaderShared {
    server_id: String,
    /// Outstanding calls. `None` once stdout has closed.
    pending: StdMutex<Option<HashMap<RequestId, oneshot::Sender<CallResult>>>>,
    /// Receives the `initialize` result; taken on first match.
    handshake: StdMutex<Option<oneshot::Sender<serde_json::Value>>>,
    initialized: AtomicBool,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReaderShared {
    fn dispatch_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let message: InboundMessage = match serde_json::from_str(trimmed) {
            Ok(m) => m,
            Err(_) => {
                self.log_unmatched(trimmed);
                return;
            }
        };

        if message.is_initialize_response() {
            if let Some(tx) = lock(&self.handshake).take() {
                let _ = tx.send(message.result.unwrap_or_default());
                return;
            }
        }

        if message.is_response() {
            if let Some(tx) = self.take_pending(message.id.as_ref()) {
                let outcome = match message.remote_error() {
                    Some(err) => Err(BridgeError::RemoteError {
                        server: self.server_id.clone(),
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    }),
                    None => Ok(message
                        .result
                        .unwrap_or_else(|| serde_json::Value::Object(Default::default()))),
                };
                if tx.send(outcome).is_err() {
                    tracing::debug!(server = %self.server_id, "caller gave up before response arrived");
                }
                return;
            }
        }

        self.log_unmatched(trimmed);
    }

    fn take_pending(&self, id: Option<&RequestId>) -> Option<oneshot::Sender<CallResult>> {
        let id = id?;
        lock(&self.pending).as_mut()?.remove(id)
    }

    fn forget(&self, id: &RequestId) {
        if let Some(map) = lock(&self.pending).as_mut() {
            map.remove(id);
        }
    }

    fn log_unmatched(&self, line: &str) {
        if self.initialized.load(Ordering::Relaxed) {
            tracing::info!(server = %self.server_id, line, "stdout");
        } else {
            tracing::debug!(server = %self.server_id, line, "ignoring output during handshake");
        }
    }

    /// Fail every outstanding call and refuse new ones.
    fn close(&self, reason: &str) {
        let drained = lock(&self.pending).take().unwrap_or_default();
        lock(&self.handshake).take();

        if !drained.is_empty() {
            tracing::warn!(
                server = %self.server_id,
                count = drained.len(),
                reason,
                "failing pending requests"
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(BridgeError::Transport {
                server: self.server_id.clone(),
                reason: reason.to_string(),
            }));
        }
    }
}

/// A registered pending call; dropping it unregisters the id.
struct PendingSlot<'a> {
    shared: &'a ReaderShared,
    id: &'a RequestId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.forget(self.id);
    }
}

async fn read_loop<R>(reader: R, shared: Arc<ReaderShared>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "server stdout closed (process may have exited)".to_string(),
            Ok(_) => shared.dispatch_line(&String::from_utf8_lossy(&buf)),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::debug!(server = %shared.server_id, reason = %reason, "reader stopped");
    shared.close(&reason);
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    shared: Arc<ReaderShared>,
    writer: Mutex<BoxedWriter>,
    handshake_rx: StdMutex<Option<oneshot::Receiver<serde_json::Value>>>,
    reader_task: JoinHandle<()>,
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl StdioTransport {
    /// Wrap a process's stdin/stdout and start the reader task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new<W, R>(server_id: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let shared = Arc::new(ReaderShared {
            server_id: server_id.to_string(),
            pending: StdMutex::new(Some(HashMap::new())),
            handshake: StdMutex::new(Some(handshake_tx)),
            initialized: AtomicBool::new(false),
        });

        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            handshake_rx: StdMutex::new(Some(handshake_rx)),
            reader_task,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    /// Whether stdout has closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.shared.pending).is_none()
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).as_ref().map_or(0, HashMap::len)
    }

    /// Send the `initialize` request and wait for its answer.
    ///
    /// Only an id-1 response whose result carries `protocolVersion` counts.
    /// Can be performed once per transport.
    pub async fn initialize(&self, timeout: Duration) -> CallResult {
        let rx = lock(&self.handshake_rx).take().ok_or_else(|| BridgeError::Transport {
            server: self.server_id().to_string(),
            reason: "initialization handshake already performed".into(),
        })?;

        let request = JsonRpcRequest::new(
            RequestId::Number(INITIALIZE_REQUEST_ID),
            "initialize",
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        self.write_message(&request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(BridgeError::Transport {
                server: self.server_id().to_string(),
                reason: "server stdout closed before initialization completed".into(),
            }),
            Err(_) => Err(BridgeError::Timeout {
                server: self.server_id().to_string(),
                operation: "initialize".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Switch unmatched-output logging from handshake to steady-state mode.
    pub fn mark_initialized(&self) {
        self.shared.initialized.store(true, Ordering::Relaxed);
    }

    /// Send a request and wait up to `timeout` for the response with its id.
    ///
    /// A timeout fails only this call; the process keeps running.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> CallResult {
        let id = RequestId::generate();
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = lock(&self.shared.pending);
            let Some(map) = pending.as_mut() else {
                return Err(self.closed_error());
            };
            map.insert(id.clone(), tx);
        }
        // Removes the entry on every exit path, including the caller dropping this future.
        let _slot = PendingSlot {
            shared: &self.shared,
            id: &id,
        };

        let request = JsonRpcRequest::new(id.clone(), method, params);
        tracing::debug!(server = %self.server_id(), id = %id, method, "sending request");

        self.write_message(&request).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(BridgeError::Timeout {
                server: self.server_id().to_string(),
                operation: format!("request '{method}'"),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), BridgeError> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::Transport {
            server: self.server_id().to_string(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), BridgeError> {
        let mut line = serde_json::to_string(message).map_err(|e| BridgeError::Transport {
            server: self.server_id().to_string(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::Transport {
                server: self.server_id().to_string(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| BridgeError::Transport {
            server: self.server_id().to_string(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }
}

// ─── Correlated Send ─────────────────────────────────────────────────────────

/// Call `method` on a registered, initialized server.
pub async fn send(
    registry: &Registry,
    server_id: &str,
    method: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> CallResult {
    let process = registry
        .get_process(server_id)
        .await
        .ok_or_else(|| BridgeError::ServerNotFound {
            server: server_id.to_string(),
        })?;
    send_on(registry, &process, method, params, timeout).await
}

/// [`send`] against an already looked-up process.
pub(crate) async fn send_on(
    registry: &Registry,
    process: &ManagedProcess,
    method: &str,
    params: serde_json::Value,
    timeout: Duration,
) -> CallResult {
    match registry.init_state(&process.server_id).await {
        Some(InitState::Initialized) => {}
        state => {
            return Err(BridgeError::NotInitialized {
                server: process.server_id.clone(),
                state,
            })
        }
    }

    tracing::info!(server = %process.server_id, method, "sending request");
    process.transport.request(method, params, timeout).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
