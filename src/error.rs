//! Error types for the toolgate service plane.
//!
//! Every failure the gateway can surface maps onto one variant here, each
//! with a stable machine-readable code string used in HTTP error envelopes
//! and SSE `error` events. Wrapping variants ([`GatewayError::Middleware`],
//! [`GatewayError::Routing`]) preserve the underlying cause.

use thiserror::Error;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request or configuration failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No acceptable credential was presented.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credential was valid but lacks permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Named template, instance, or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Principal exhausted its token bucket.
    #[error("rate limited, retry in {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds until one token is available again.
        retry_after_ms: u64,
    },

    /// Deadline elapsed before the operation completed.
    #[error("timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the operation ran before being cut off.
        elapsed_ms: u64,
    },

    /// Operation was canceled via a cancellation token.
    #[error("canceled")]
    Canceled,

    /// The peer returned a well-formed JSON-RPC error where a result was
    /// required (initialize negotiation, health probes).
    #[error("backend error {code}: {message}")]
    BackendError {
        /// JSON-RPC error code from the peer.
        code: i64,
        /// JSON-RPC error message from the peer.
        message: String,
    },

    /// The peer sent bytes that are not a valid protocol envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Channel to the backend broke or could not be established.
    #[error("transport failure on {instance} ({transport}): {detail}")]
    TransportFailure {
        /// Instance the adapter belongs to.
        instance: String,
        /// Transport kind, e.g. `"stdio"`.
        transport: String,
        /// Human-readable description of the break.
        detail: String,
    },

    /// Circuit breaker refused the request.
    #[error("circuit open for instance {instance}")]
    BreakerOpen {
        /// Instance whose breaker is open.
        instance: String,
    },

    /// No candidate instance survived routing.
    #[error("no service available for group {group}")]
    NoServiceAvailable {
        /// Group (template name) that had no usable instance.
        group: String,
    },

    /// Request ceiling reached; the caller should back off.
    #[error("gateway at capacity")]
    Overloaded,

    /// A middleware failed; wraps the cause with chain position.
    #[error("middleware {middleware} failed at {stage}: {source}")]
    Middleware {
        /// Stage the failure occurred at.
        stage: &'static str,
        /// Name of the failing middleware.
        middleware: String,
        /// Underlying failure.
        #[source]
        source: Box<GatewayError>,
    },

    /// A routing attempt failed; wraps the cause with the decision so far.
    #[error("routing {group} via {strategy} failed: {source}")]
    Routing {
        /// Group that was being routed.
        group: String,
        /// Strategy in effect when the failure happened.
        strategy: String,
        /// Underlying failure.
        #[source]
        source: Box<GatewayError>,
    },

    /// Unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Stable machine-readable code for the error envelope.
    ///
    /// Wrapping variants report the code of their root cause so clients can
    /// dispatch without unwrapping.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Canceled => "canceled",
            Self::BackendError { .. } => "backend_error",
            Self::Protocol(_) => "protocol_error",
            Self::TransportFailure { .. } => "transport_failure",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::NoServiceAvailable { .. } => "no_service_available",
            Self::Overloaded => "overloaded",
            Self::Middleware { source, .. } | Self::Routing { source, .. } => source.code(),
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "internal",
        }
    }

    /// Whether the caller may reasonably retry the same request.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::TransportFailure { .. }
            | Self::Overloaded => true,
            Self::Middleware { source, .. } | Self::Routing { source, .. } => source.recoverable(),
            _ => false,
        }
    }

    /// HTTP status the surface maps this error onto.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Protocol(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::Timeout { .. } => 504,
            Self::NoServiceAvailable { .. } | Self::Overloaded | Self::BreakerOpen { .. } => 503,
            Self::BackendError { .. } | Self::TransportFailure { .. } => 502,
            Self::Middleware { source, .. } | Self::Routing { source, .. } => source.http_status(),
            Self::Canceled | Self::Internal(_) | Self::Io(_) | Self::Json(_) => 500,
        }
    }

    /// Unwraps context layers down to the root cause.
    #[must_use]
    pub fn root(&self) -> &GatewayError {
        match self {
            Self::Middleware { source, .. } | Self::Routing { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(GatewayError::Validation("x".into()).code(), "validation");
        assert_eq!(GatewayError::Overloaded.code(), "overloaded");
        assert_eq!(
            GatewayError::NoServiceAvailable { group: "g".into() }.code(),
            "no_service_available"
        );
        assert_eq!(GatewayError::Canceled.code(), "canceled");
    }

    #[test]
    fn wrapping_preserves_code_and_recoverability() {
        let inner = GatewayError::Timeout { elapsed_ms: 200 };
        let wrapped = GatewayError::Middleware {
            stage: "before_tool",
            middleware: "rate-limit".into(),
            source: Box::new(inner),
        };
        assert_eq!(wrapped.code(), "timeout");
        assert!(wrapped.recoverable());
        assert!(matches!(wrapped.root(), GatewayError::Timeout { .. }));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::Unauthorized("no token".into()).http_status(), 401);
        assert_eq!(GatewayError::RateLimited { retry_after_ms: 1 }.http_status(), 429);
        assert_eq!(GatewayError::Overloaded.http_status(), 503);
        assert_eq!(
            GatewayError::BreakerOpen { instance: "i".into() }.http_status(),
            503
        );
    }

    #[test]
    fn recoverable_flags() {
        assert!(GatewayError::TransportFailure {
            instance: "i".into(),
            transport: "stdio".into(),
            detail: "broken pipe".into(),
        }
        .recoverable());
        assert!(!GatewayError::Forbidden("nope".into()).recoverable());
    }

    #[test]
    fn display_includes_context() {
        let err = GatewayError::Routing {
            group: "echo".into(),
            strategy: "round-robin".into(),
            source: Box::new(GatewayError::NoServiceAvailable { group: "echo".into() }),
        };
        let text = err.to_string();
        assert!(text.contains("echo"));
        assert!(text.contains("round-robin"));
    }
}
