//! HTTP transport adapter.
//!
//! One POST per call: the request envelope is the body, the reply envelope
//! is the response body. Stateless on the wire, so concurrent calls
//! multiplex freely and `connect` only has to prove the endpoint speaks the
//! protocol.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    Adapter, AdapterEvent, EVENT_CHANNEL_CAPACITY, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, NEGOTIATION_TIMEOUT, TransportKind, initialize_request,
};
use crate::error::{GatewayError, Result};

/// Adapter speaking the tool protocol over plain HTTP POST.
pub struct HttpAdapter {
    instance_id: String,
    url: String,
    headers: BTreeMap<String, String>,
    protocol_version: String,
    client: reqwest::Client,
    connected: AtomicBool,
    events: broadcast::Sender<AdapterEvent>,
}

impl HttpAdapter {
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
            connected: AtomicBool::new(false),
            events,
        }
    }

    fn transport_failure(&self, detail: impl Into<String>) -> GatewayError {
        GatewayError::TransportFailure {
            instance: self.instance_id.clone(),
            transport: TransportKind::Http.to_string(),
            detail: detail.into(),
        }
    }

    /// POSTs one envelope and returns the raw response.
    async fn post(&self, body: &impl serde::Serialize, timeout: Duration) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .timeout(timeout);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

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
        Ok(response)
    }

    /// Parses a reply body and checks it answers `request_id`.
    fn parse_reply(&self, body: &[u8], request_id: &serde_json::Value) -> Result<JsonRpcResponse> {
        let message: JsonRpcMessage = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Protocol(format!("invalid reply envelope: {e}")))?;
        let JsonRpcMessage::Response(reply) = message else {
            return Err(GatewayError::Protocol(
                "peer answered with a non-response envelope".to_string(),
            ));
        };
        if !reply.answers(request_id) {
            return Err(GatewayError::Protocol(format!(
                "reply id {} does not match request id {request_id}",
                reply.id
            )));
        }
        Ok(reply)
    }
}

#[async_trait::async_trait]
impl Adapter for HttpAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self) -> Result<()> {
        let init = initialize_request(&self.protocol_version);
        let id = init.id.clone();
        let response = self.post(&init, NEGOTIATION_TIMEOUT).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_failure(e.to_string()))?;
        // Negotiation accepts a result or an error, but it must be a reply.
        self.parse_reply(&body, &id)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(AdapterEvent::Closed {
            reason: "disconnected".to_string(),
        });
        Ok(())
    }

    async fn send(&self, notification: JsonRpcNotification) -> Result<()> {
        // Notifications have no reply; any 2xx acknowledges delivery.
        self.post(&notification, NEGOTIATION_TIMEOUT).await.map(|_| ())
    }

    async fn send_and_receive(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let id = request.id.clone();
        let started = Instant::now();
        let exchange = async {
            let response = self.post(&request, timeout).await?;
            let body = response
                .bytes()
                .await
                .map_err(|e| self.transport_failure(e.to_string()))?;
            self.parse_reply(&body, &id)
        };

        tokio::select! {
            () = cancel.cancelled() => Err(GatewayError::Canceled),
            () = tokio::time::sleep(timeout) => Err(GatewayError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
            reply = exchange => reply,
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for HttpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdapter")
            .field("instance_id", &self.instance_id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}
