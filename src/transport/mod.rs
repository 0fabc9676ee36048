//! Transport adapters for the tool protocol.
//!
//! Provides the [`Adapter`] trait plus one implementation per backend shape:
//! stdio child processes ([`StdioAdapter`]), plain HTTP endpoints
//! ([`HttpAdapter`]), SSE streams ([`SseAdapter`]), and containerized
//! children (stdio semantics behind a container runtime, assembled in
//! [`container`]). Adapters own channel lifecycle and `id` correlation; they
//! never interpret payloads.

pub mod container;
pub mod http;
pub mod jsonrpc;
pub mod sandbox;
pub mod sse;
pub mod stdio;

pub use http::HttpAdapter;
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, id_key,
};
pub use sse::SseAdapter;
pub use stdio::StdioAdapter;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Timeout for the `initialize` negotiation performed by `connect`.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between the soft termination signal and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Capacity of each adapter's event broadcast channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Transport kind identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Line-delimited JSON over a child process's stdin/stdout.
    Stdio,
    /// One HTTP POST per call.
    Http,
    /// HTTP POST to submit, server-sent events to consume.
    Sse,
    /// Stdio semantics, child launched under a container runtime.
    Container,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Http => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Out-of-band event surfaced by an adapter.
///
/// Stderr lines and peer notifications do not belong to any correlated
/// exchange; subscribers (the registry's log rings, the event bus) consume
/// them through [`Adapter::subscribe_events`].
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A line the child process wrote to standard error.
    Stderr {
        /// The raw line, control characters stripped.
        line: String,
    },
    /// A notification initiated by the peer.
    Notification(JsonRpcNotification),
    /// The channel closed; no further events will arrive.
    Closed {
        /// Why the channel went away.
        reason: String,
    },
}

/// One backend channel speaking the tool protocol.
///
/// `send_and_receive` is the only correlated request path: it returns the
/// reply whose `id` matches the request's, or fails. `send` exists for
/// notifications alone and never yields a reply; inbound notifications
/// surface via [`subscribe_events`](Self::subscribe_events).
///
/// Stdio and container adapters serialize exchanges internally so at most
/// one request is outstanding per channel; HTTP and SSE adapters may
/// multiplex by `id`.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// The transport kind this adapter speaks.
    fn kind(&self) -> TransportKind;

    /// Establishes the channel and performs protocol negotiation.
    ///
    /// Sends an `initialize` envelope at the configured protocol version and
    /// requires a JSON-RPC response (result **or** error) within
    /// [`NEGOTIATION_TIMEOUT`]. A missing or misshapen reply marks the
    /// connection invalid and the resources acquired so far are released.
    ///
    /// # Errors
    ///
    /// Returns a transport, protocol, or timeout error when the channel
    /// cannot be established or negotiation fails.
    async fn connect(&self) -> Result<()>;

    /// Releases all channel resources.
    ///
    /// Child processes receive a soft termination signal and are force-killed
    /// after [`KILL_GRACE`]. Pending reply waiters are canceled; file
    /// descriptors and process handles are closed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when teardown itself fails; the adapter is
    /// considered disconnected regardless.
    async fn disconnect(&self) -> Result<()>;

    /// Sends a notification. No reply is expected or returned.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the channel is closed or the write
    /// fails.
    async fn send(&self, notification: JsonRpcNotification) -> Result<()>;

    /// Sends a request and awaits the reply whose `id` matches.
    ///
    /// # Errors
    ///
    /// Fails with `Timeout` when `timeout` elapses, `Canceled` when `cancel`
    /// trips, `TransportFailure` when the channel breaks, or a protocol
    /// error when the peer's bytes are not a valid envelope. A well-formed
    /// reply carrying an `error` member is returned verbatim, not mapped to
    /// an error.
    async fn send_and_receive(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse>;

    /// Subscribes to out-of-band adapter events.
    fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent>;
}

/// Builds the `initialize` request sent during negotiation.
#[must_use]
pub fn initialize_request(protocol_version: &str) -> JsonRpcRequest {
    JsonRpcRequest::new(
        "initialize",
        Some(json!({
            "protocolVersion": protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": "toolgate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        })),
        Value::String(format!("init-{}", uuid::Uuid::new_v4().simple())),
    )
}

/// Strips control characters and truncates untrusted text before it reaches
/// logs or the event bus.
#[must_use]
pub(crate) fn sanitize_line(input: &str, max_len: usize) -> String {
    input
        .chars()
        .take(max_len)
        .map(|c| if c.is_control() && c != '\t' { '\u{FFFD}' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display() {
        assert_eq!(TransportKind::Stdio.to_string(), "stdio");
        assert_eq!(TransportKind::Container.to_string(), "container");
    }

    #[test]
    fn kind_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&TransportKind::Sse).unwrap(), "\"sse\"");
        let kind: TransportKind = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(kind, TransportKind::Http);
    }

    #[test]
    fn initialize_request_shape() {
        let req = initialize_request("2025-06-18");
        assert_eq!(req.method, "initialize");
        let params = req.params.unwrap();
        assert_eq!(params["protocolVersion"], "2025-06-18");
        assert!(req.id.as_str().unwrap().starts_with("init-"));
    }

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize_line("ok\u{1b}[31m", 64), "ok\u{FFFD}[31m");
        assert_eq!(sanitize_line("tab\tkept", 64), "tab\tkept");
        assert_eq!(sanitize_line("abcdef", 3), "abc");
    }
}
