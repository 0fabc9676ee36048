//! Staged middleware pipeline.
//!
//! Every inbound request walks six named stages in fixed order; each
//! middleware implements whatever subset it cares about and shares a
//! [`ChainState`]: a values map (last writer wins), an `aborted` flag, and
//! the terminal error. A failure at stage S is wrapped with the middleware
//! name and stage, skips the rest of S, and is re-raised; later stages can
//! still be run by the caller and observe `aborted`. Per-middleware and
//! per-stage timeouts plus an external cancellation token bound every hook.

pub mod auth;
pub mod balancer_stage;
pub mod rate_limit;
pub mod security;

pub use auth::{AuthMiddleware, Authenticator, HandshakeManager, Principal};
pub use balancer_stage::BalancerMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use security::SecurityGuard;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Value key: raw `Authorization` header.
pub const VAL_AUTHORIZATION: &str = "http.authorization";
/// Value key: raw `X-API-Key` header.
pub const VAL_API_KEY: &str = "http.apiKey";
/// Value key: request `Origin` header.
pub const VAL_ORIGIN: &str = "http.origin";
/// Value key: tool-protocol method of the request.
pub const VAL_METHOD: &str = "request.method";
/// Value key: requested service group.
pub const VAL_GROUP: &str = "request.serviceGroup";
/// Value key: request params (scanned by the security guard).
pub const VAL_PARAMS: &str = "request.params";
/// Value key: instance chosen for the tool stage.
pub const VAL_INSTANCE: &str = "proxy.instanceId";
/// Value key: tool-stage outcome `{instanceId, ok, latencyMs}`.
pub const VAL_OUTCOME: &str = "proxy.outcome";
/// Value key: tool result payload (redacted in place by the guard).
pub const VAL_RESULT: &str = "tool.result";

/// The six chain stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before any request handling.
    BeforeAgent,
    /// Before model-side work.
    BeforeModel,
    /// After model-side work.
    AfterModel,
    /// Before the tool call is dispatched.
    BeforeTool,
    /// After the tool call returned.
    AfterTool,
    /// After the request is otherwise complete.
    AfterAgent,
}

impl Stage {
    /// All stages in order.
    pub const ALL: [Self; 6] = [
        Self::BeforeAgent,
        Self::BeforeModel,
        Self::AfterModel,
        Self::BeforeTool,
        Self::AfterTool,
        Self::AfterAgent,
    ];

    /// Stable snake_case name used in error context.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BeforeAgent => "before_agent",
            Self::BeforeModel => "before_model",
            Self::AfterModel => "after_model",
            Self::BeforeTool => "before_tool",
            Self::AfterTool => "after_tool",
            Self::AfterAgent => "after_agent",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state threaded through one request's chain run.
#[derive(Debug, Default)]
pub struct ChainState {
    /// Shared key/value scratch space; collisions are last-writer-wins.
    pub values: HashMap<String, Value>,
    /// Set once any middleware fails or times out.
    pub aborted: bool,
    /// Code string of the terminal error, when aborted.
    pub error: Option<String>,
    /// Authenticated principal, attached by the auth middleware.
    pub principal: Option<Principal>,
}

impl ChainState {
    /// Fresh state for one request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// String view of one value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Inserts a value (last writer wins).
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }
}

/// One interceptor; implement any subset of the stage hooks.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in wrapped errors.
    fn name(&self) -> &str;

    /// Hook for [`Stage::BeforeAgent`].
    async fn before_agent(&self, _state: &mut ChainState) -> Result<()> {
        Ok(())
    }
    /// Hook for [`Stage::BeforeModel`].
    async fn before_model(&self, _state: &mut ChainState) -> Result<()> {
        Ok(())
    }
    /// Hook for [`Stage::AfterModel`].
    async fn after_model(&self, _state: &mut ChainState) -> Result<()> {
        Ok(())
    }
    /// Hook for [`Stage::BeforeTool`].
    async fn before_tool(&self, _state: &mut ChainState) -> Result<()> {
        Ok(())
    }
    /// Hook for [`Stage::AfterTool`].
    async fn after_tool(&self, _state: &mut ChainState) -> Result<()> {
        Ok(())
    }
    /// Hook for [`Stage::AfterAgent`].
    async fn after_agent(&self, _state: &mut ChainState) -> Result<()> {
        Ok(())
    }
}

/// Chain timeout knobs.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Budget for one whole stage.
    pub stage_timeout: Option<Duration>,
    /// Budget for one middleware invocation.
    pub middleware_timeout: Option<Duration>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Some(Duration::from_secs(30)),
            middleware_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Executes middlewares in insertion order per stage.
#[derive(Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
    config: ChainConfig,
}

impl MiddlewareChain {
    /// Builds a chain from middlewares in insertion order.
    #[must_use]
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, config: ChainConfig) -> Self {
        Self {
            middlewares,
            config,
        }
    }

    /// Runs one stage across all middlewares.
    ///
    /// The first failure wraps the cause with middleware name and stage,
    /// records it in the state, skips the remaining middlewares of the
    /// stage, and is returned. Middlewares themselves decide how to react
    /// to an already-aborted state.
    ///
    /// # Errors
    ///
    /// The wrapped middleware failure, `Timeout` on budget exhaustion, or
    /// `Canceled` when the token trips.
    pub async fn run_stage(
        &self,
        stage: Stage,
        state: &mut ChainState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stage_started = Instant::now();
        for middleware in &self.middlewares {
            let budget = self.invocation_budget(stage_started);
            let hook = Self::invoke(middleware.as_ref(), stage, state);

            let outcome = tokio::select! {
                () = cancel.cancelled() => Err(GatewayError::Canceled),
                result = async {
                    match budget {
                        Some(limit) => tokio::time::timeout(limit, hook)
                            .await
                            .unwrap_or_else(|_| Err(GatewayError::Timeout {
                                elapsed_ms: limit.as_millis() as u64,
                            })),
                        None => hook.await,
                    }
                } => result,
            };

            if let Err(cause) = outcome {
                let wrapped = GatewayError::Middleware {
                    stage: stage.as_str(),
                    middleware: middleware.name().to_string(),
                    source: Box::new(cause),
                };
                state.aborted = true;
                state.error = Some(wrapped.code().to_string());
                debug!(stage = %stage, middleware = middleware.name(), "chain aborted");
                return Err(wrapped);
            }
        }
        Ok(())
    }

    /// Runs every stage in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Propagates the first stage failure.
    pub async fn run_all(&self, state: &mut ChainState, cancel: &CancellationToken) -> Result<()> {
        for stage in Stage::ALL {
            self.run_stage(stage, state, cancel).await?;
        }
        Ok(())
    }

    fn invocation_budget(&self, stage_started: Instant) -> Option<Duration> {
        let stage_left = self
            .config
            .stage_timeout
            .map(|t| t.saturating_sub(stage_started.elapsed()));
        match (self.config.middleware_timeout, stage_left) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    async fn invoke(
        middleware: &dyn Middleware,
        stage: Stage,
        state: &mut ChainState,
    ) -> Result<()> {
        match stage {
            Stage::BeforeAgent => middleware.before_agent(state).await,
            Stage::BeforeModel => middleware.before_model(state).await,
            Stage::AfterModel => middleware.after_model(state).await,
            Stage::BeforeTool => middleware.before_tool(state).await,
            Stage::AfterTool => middleware.after_tool(state).await,
            Stage::AfterAgent => middleware.after_agent(state).await,
        }
    }
}
