//! Stdio transport adapter.
//!
//! Speaks line-delimited JSON to a child process's stdin/stdout. A reader
//! task parses every stdout line and resolves the matching pending-reply
//! waiter by `id`; stderr lines are forwarded to event subscribers as
//! warnings. An internal exchange lock guarantees at most one correlated
//! request is outstanding on the channel at any time.
//!
//! The container transport reuses this adapter verbatim: the only difference
//! is the argv handed to [`StdioAdapter::new`], which the container module
//! rewrites to invoke the container runtime.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Adapter, AdapterEvent, EVENT_CHANNEL_CAPACITY, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, KILL_GRACE, NEGOTIATION_TIMEOUT, TransportKind,
    initialize_request, sanitize_line,
};
use crate::error::{GatewayError, Result};

/// Maximum length of a stderr line forwarded to subscribers.
const MAX_STDERR_LINE: usize = 2048;

/// Fully resolved launch recipe for a child process.
///
/// Produced by the sandbox layer: `program` has already been resolved
/// against the executable allow-list and `env` no longer contains a PATH
/// override or unresolved secrets.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Absolute path of the executable.
    pub program: PathBuf,
    /// Arguments, env references already resolved.
    pub args: Vec<String>,
    /// Environment overlay applied on top of the gateway's environment.
    pub env: BTreeMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
}

/// Live channel state: the child plus its I/O tasks.
struct Channel {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
}

/// Adapter speaking line-delimited JSON to a spawned child process.
pub struct StdioAdapter {
    instance_id: String,
    kind: TransportKind,
    launch: LaunchSpec,
    protocol_version: String,
    channel: Mutex<Option<Channel>>,
    /// Serializes `send_and_receive` so one exchange is in flight at most.
    exchange: Mutex<()>,
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    events: broadcast::Sender<AdapterEvent>,
}

impl StdioAdapter {
    /// Creates a disconnected adapter for the given instance and launch spec.
    ///
    /// `kind` is [`TransportKind::Stdio`] or [`TransportKind::Container`];
    /// both share this implementation.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        kind: TransportKind,
        launch: LaunchSpec,
        protocol_version: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            instance_id: instance_id.into(),
            kind,
            launch,
            protocol_version: protocol_version.into(),
            channel: Mutex::new(None),
            exchange: Mutex::new(()),
            pending: Arc::new(DashMap::new()),
            events,
        }
    }

    fn transport_failure(&self, detail: impl Into<String>) -> GatewayError {
        GatewayError::TransportFailure {
            instance: self.instance_id.clone(),
            transport: self.kind.to_string(),
            detail: detail.into(),
        }
    }

    /// Spawns the child and wires up the reader tasks.
    async fn open_channel(&self) -> Result<()> {
        let mut guard = self.channel.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut command = Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.launch.env.is_empty() {
            command.envs(&self.launch.env);
        }
        if let Some(dir) = &self.launch.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            self.transport_failure(format!(
                "failed to spawn {}: {e}",
                self.launch.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_failure("child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_failure("child has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.transport_failure("child has no stderr"))?;

        debug!(instance = %self.instance_id, pid = child.id(), "child process spawned");

        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let instance = self.instance_id.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                            Ok(JsonRpcMessage::Response(resp)) => {
                                if let Some((_, tx)) = pending.remove(&resp.id_key()) {
                                    let _ = tx.send(resp);
                                } else {
                                    debug!(instance = %instance, "reply with no waiter, dropped");
                                }
                            }
                            Ok(JsonRpcMessage::Notification(notif)) => {
                                let _ = events.send(AdapterEvent::Notification(notif));
                            }
                            Ok(JsonRpcMessage::Request(req)) => {
                                debug!(instance = %instance, method = %req.method,
                                    "peer-initiated request not supported, dropped");
                            }
                            Err(e) => {
                                warn!(instance = %instance, error = %e,
                                    line = %sanitize_line(trimmed, 200),
                                    "invalid envelope from peer, skipped");
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(instance = %instance, error = %e, "stdout read failed");
                        break;
                    }
                }
            }
            // EOF or read error: every waiter learns the channel is gone.
            pending.clear();
            let _ = events.send(AdapterEvent::Closed {
                reason: "stdout closed".to_string(),
            });
        });

        let events = self.events.clone();
        let instance = self.instance_id.clone();
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = sanitize_line(&line, MAX_STDERR_LINE);
                warn!(instance = %instance, "backend stderr: {line}");
                let _ = events.send(AdapterEvent::Stderr { line });
            }
        });

        *guard = Some(Channel {
            child,
            stdin,
            reader,
            stderr_reader,
        });
        Ok(())
    }

    /// Writes one serialized envelope line to the child's stdin.
    async fn write_line(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| self.transport_failure("not connected"))?;
        channel.stdin.write_all(payload).await?;
        channel.stdin.write_all(b"\n").await?;
        channel.stdin.flush().await?;
        Ok(())
    }

    /// The uncorrelated exchange body shared by `connect` and
    /// `send_and_receive`; the caller holds the exchange lock.
    async fn exchange_once(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let key = request.id_key();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let payload = serde_json::to_vec(&request)?;
        if let Err(e) = self.write_line(&payload).await {
            self.pending.remove(&key);
            return Err(e);
        }

        let started = Instant::now();
        tokio::select! {
            () = cancel.cancelled() => {
                self.pending.remove(&key);
                Err(GatewayError::Canceled)
            }
            () = tokio::time::sleep(timeout) => {
                self.pending.remove(&key);
                Err(GatewayError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            reply = rx => reply.map_err(|_| self.transport_failure("channel closed while waiting")),
        }
    }

    /// Tears the channel down, signaling the child softly first.
    async fn teardown(&self) -> Result<()> {
        let Some(mut channel) = self.channel.lock().await.take() else {
            return Ok(());
        };

        channel.reader.abort();
        channel.stderr_reader.abort();
        // Closing stdin lets well-behaved children exit on their own.
        drop(channel.stdin);

        terminate_child(&mut channel.child, &self.instance_id).await;

        self.pending.clear();
        let _ = self.events.send(AdapterEvent::Closed {
            reason: "disconnected".to_string(),
        });
        Ok(())
    }
}

/// Soft-terminates the child, escalating to a hard kill after [`KILL_GRACE`].
async fn terminate_child(child: &mut Child, instance: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we own; no memory is touched.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            debug!(instance, "child exited after SIGTERM");
            return;
        }
        warn!(instance, "child ignored SIGTERM, killing");
    }

    if let Err(e) = child.kill().await {
        warn!(instance, error = %e, "failed to kill child");
    }
}

#[async_trait::async_trait]
impl Adapter for StdioAdapter {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self) -> Result<()> {
        self.open_channel().await?;

        // Negotiation failure invalidates the connection entirely.
        let _guard = self.exchange.lock().await;
        let init = initialize_request(&self.protocol_version);
        match self
            .exchange_once(init, NEGOTIATION_TIMEOUT, &CancellationToken::new())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                drop(_guard);
                let _ = self.teardown().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.teardown().await
    }

    async fn send(&self, notification: JsonRpcNotification) -> Result<()> {
        let payload = serde_json::to_vec(&notification)?;
        self.write_line(&payload).await
    }

    async fn send_and_receive(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let _guard = self.exchange.lock().await;
        self.exchange_once(request, timeout, cancel).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for StdioAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioAdapter")
            .field("instance_id", &self.instance_id)
            .field("kind", &self.kind)
            .field("program", &self.launch.program)
            .finish_non_exhaustive()
    }
}
