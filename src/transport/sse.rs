//! SSE transport adapter.
//!
//! Requests are submitted with HTTP POST while a concurrent GET consumes the
//! backend's `text/event-stream`. Replies are correlated with their requests
//! by JSON-RPC `id` through a pending map, so the adapter multiplexes freely.
//! Backends may also answer a POST inline (JSON body or a per-request event
//! stream); both paths feed the same dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Adapter, AdapterEvent, EVENT_CHANNEL_CAPACITY, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, NEGOTIATION_TIMEOUT, TransportKind, initialize_request,
};
use crate::error::{GatewayError, Result};

type PendingMap = Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>;

/// Adapter speaking the tool protocol over POST + server-sent events.
pub struct SseAdapter {
    instance_id: String,
    url: String,
    headers: BTreeMap<String, String>,
    protocol_version: String,
    client: reqwest::Client,
    pending: PendingMap,
    events: broadcast::Sender<AdapterEvent>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SseAdapter {
    /// Creates a disconnected adapter for the given endpoint.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
        protocol_version: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            instance_id: instance_id.into(),
            url: url.into(),
            headers,
            protocol_version: protocol_version.into(),
            client: reqwest::Client::new(),
            pending: Arc::new(DashMap::new()),
            events,
            stream_task: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn transport_failure(&self, detail: impl Into<String>) -> GatewayError {
        GatewayError::TransportFailure {
            instance: self.instance_id.clone(),
            transport: TransportKind::Sse.to_string(),
            detail: detail.into(),
        }
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request
    }

    /// Starts the long-lived GET consumer if it is not already running.
    async fn ensure_stream(&self) {
        let mut guard = self.stream_task.lock().await;
        if guard.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let request = self
            .apply_headers(self.client.get(&self.url))
            .header("accept", "text/event-stream");
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let instance = self.instance_id.clone();
        let cancel = self.cancel.child_token();

        *guard = Some(tokio::spawn(async move {
            let response = match request.send().await {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    // Some backends only answer POSTs inline; that is fine.
                    debug!(instance = %instance, status = %r.status(),
                        "event stream unavailable, relying on POST replies");
                    return;
                }
                Err(e) => {
                    warn!(instance = %instance, error = %e, "event stream connect failed");
                    return;
                }
            };

            let reader = BufReader::new(StreamReader::new(
                response.bytes_stream().map(|r| r.map_err(std::io::Error::other)),
            ));
            tokio::select! {
                () = cancel.cancelled() => {}
                () = pump_sse(reader, &pending, &events, &instance) => {}
            }
            let _ = events.send(AdapterEvent::Closed {
                reason: "event stream ended".to_string(),
            });
        }));
    }

    /// Submits one envelope; inline replies are dispatched immediately,
    /// streamed replies resolve through the pending map.
    async fn submit(&self, body: &impl serde::Serialize, timeout: Duration) -> Result<()> {
        let request = self
            .apply_headers(self.client.post(&self.url))
            .header("content-type", "application/json")
            .header("accept", "text/event-stream, application/json")
            .timeout(timeout);

        let response = request.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                }
            } else {
                self.transport_failure(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_failure(format!("HTTP {status}: {body}")));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            // Per-request stream: feed it to the shared dispatcher.
            let pending = Arc::clone(&self.pending);
            let events = self.events.clone();
            let instance = self.instance_id.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(StreamReader::new(
                    response.bytes_stream().map(|r| r.map_err(std::io::Error::other)),
                ));
                pump_sse(reader, &pending, &events, &instance).await;
            });
        } else if content_type.contains("application/json") {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| self.transport_failure(e.to_string()))?;
            if !bytes.is_empty() {
                dispatch_message(&bytes, &self.pending, &self.events, &self.instance_id);
            }
        }
        Ok(())
    }
}

/// Reads an SSE stream, accumulating `data:` lines into messages.
async fn pump_sse<R: AsyncBufRead + Unpin>(
    mut reader: R,
    pending: &PendingMap,
    events: &broadcast::Sender<AdapterEvent>,
    instance: &str,
) {
    let mut line = String::new();
    let mut data = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if let Some(payload) = trimmed.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(payload.trim_start());
                } else if trimmed.is_empty() && !data.is_empty() {
                    dispatch_message(data.as_bytes(), pending, events, instance);
                    data.clear();
                }
                // Comment lines (":") and event/id fields are ignored.
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "event stream read failed");
                break;
            }
        }
    }
    if !data.is_empty() {
        dispatch_message(data.as_bytes(), pending, events, instance);
    }
}

/// Routes one parsed envelope to its waiter or to event subscribers.
fn dispatch_message(
    bytes: &[u8],
    pending: &PendingMap,
    events: &broadcast::Sender<AdapterEvent>,
    instance: &str,
) {
    match serde_json::from_slice::<JsonRpcMessage>(bytes) {
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
            warn!(instance = %instance, error = %e, "invalid envelope on event stream, skipped");
        }
    }
}

#[async_trait::async_trait]
impl Adapter for SseAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn connect(&self) -> Result<()> {
        self.ensure_stream().await;

        let init = initialize_request(&self.protocol_version);
        let key = init.id_key();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        if let Err(e) = self.submit(&init, NEGOTIATION_TIMEOUT).await {
            self.pending.remove(&key);
            return Err(e);
        }

        match tokio::time::timeout(NEGOTIATION_TIMEOUT, rx).await {
            Ok(Ok(_reply)) => Ok(()),
            Ok(Err(_)) => {
                Err(self.transport_failure("stream closed during negotiation"))
            }
            Err(_) => {
                self.pending.remove(&key);
                Err(GatewayError::Timeout {
                    elapsed_ms: NEGOTIATION_TIMEOUT.as_millis() as u64,
                })
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.stream_task.lock().await.take() {
            task.abort();
        }
        self.pending.clear();
        let _ = self.events.send(AdapterEvent::Closed {
            reason: "disconnected".to_string(),
        });
        Ok(())
    }

    async fn send(&self, notification: JsonRpcNotification) -> Result<()> {
        self.submit(&notification, NEGOTIATION_TIMEOUT).await
    }

    async fn send_and_receive(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let key = request.id_key();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        if let Err(e) = self.submit(&request, timeout).await {
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
            reply = rx => reply.map_err(|_| self.transport_failure("stream closed while waiting")),
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for SseAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseAdapter")
            .field("instance_id", &self.instance_id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> broadcast::Sender<AdapterEvent> {
        broadcast::channel(16).0
    }

    #[tokio::test]
    async fn pump_correlates_replies_by_id() {
        let pending: PendingMap = Arc::new(DashMap::new());
        let (tx, rx) = oneshot::channel();
        pending.insert(super::super::id_key(&json!(7)), tx);

        let stream = b"data: {\"jsonrpc\":\"2.0\",\"result\":{\"n\":1},\"id\":7}\n\n";
        pump_sse(&stream[..], &pending, &bus(), "svc-1-abc123").await;

        let reply = rx.await.unwrap();
        assert_eq!(reply.result, Some(json!({"n": 1})));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pump_forwards_notifications() {
        let pending: PendingMap = Arc::new(DashMap::new());
        let events = bus();
        let mut sub = events.subscribe();

        let stream =
            b"data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n";
        pump_sse(&stream[..], &pending, &events, "svc-1-abc123").await;

        match sub.try_recv().unwrap() {
            AdapterEvent::Notification(n) => assert_eq!(n.method, "notifications/progress"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pump_handles_multiline_data_and_comments() {
        let pending: PendingMap = Arc::new(DashMap::new());
        let (tx, rx) = oneshot::channel();
        pending.insert(super::super::id_key(&json!("m1")), tx);

        // Two data lines joined by \n per the SSE spec; comment ignored.
        let stream = b": keep-alive\ndata: {\"jsonrpc\":\"2.0\",\ndata: \"result\":null,\"id\":\"m1\"}\n\n";
        pump_sse(&stream[..], &pending, &bus(), "svc-1-abc123").await;

        let reply = rx.await.unwrap();
        assert_eq!(reply.result, Some(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn pump_skips_garbage_events() {
        let pending: PendingMap = Arc::new(DashMap::new());
        let (tx, rx) = oneshot::channel();
        pending.insert(super::super::id_key(&json!(1)), tx);

        let stream =
            b"data: not json\n\ndata: {\"jsonrpc\":\"2.0\",\"result\":true,\"id\":1}\n\n";
        pump_sse(&stream[..], &pending, &bus(), "svc-1-abc123").await;
        assert_eq!(rx.await.unwrap().result, Some(json!(true)));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let adapter = SseAdapter::new(
            "svc-1-abc123",
            "http://127.0.0.1:1/rpc",
            BTreeMap::new(),
            "2025-06-18",
        );
        let err = adapter
            .send_and_receive(
                JsonRpcRequest::new("tools/list", None, json!(1)),
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        // Endpoint is unreachable: submit fails before any wait begins.
        assert!(matches!(err.code(), "transport_failure" | "timeout"));
        assert!(adapter.pending.is_empty());
    }
}
