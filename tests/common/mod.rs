//! Shared fixtures for the integration suites.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use toolgate::balancer::Strategy;
use toolgate::config::{AuthMode, ConfigPaths, GatewayConfig};
use toolgate::events::EventBus;
use toolgate::middleware::{
    AuthMiddleware, Authenticator, BalancerMiddleware, ChainConfig, Middleware, MiddlewareChain,
    RateLimitMiddleware, SecurityGuard,
};
use toolgate::registry::ServiceRegistry;
use toolgate::router::Router;
use toolgate::transport::sandbox::SandboxPolicy;
use toolgate::web::{AppState, build_app};

/// A gateway config with auth disabled, suitable for most suites.
pub fn open_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth.mode = AuthMode::Disabled;
    config
}

/// Builds the full service plane over a temp config dir and returns the
/// axum app plus the state for direct registry access.
pub fn build_state(config: GatewayConfig, config_dir: &Path) -> AppState {
    let bus = EventBus::new();
    let registry = ServiceRegistry::new(SandboxPolicy::from_config(&config.sandbox), bus.clone());
    let authenticator = Arc::new(Authenticator::new(config.auth.clone()));
    let strategy: Strategy = config.routing.strategy;

    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(AuthMiddleware::new(Arc::clone(&authenticator))),
        Arc::new(RateLimitMiddleware::new(config.rate_limit.clone())),
        Arc::new(SecurityGuard::default()),
        Arc::new(BalancerMiddleware::new(registry.clone(), strategy)),
    ];
    let chain = MiddlewareChain::new(middlewares, ChainConfig::default());
    let router = Arc::new(Router::new(
        registry.clone(),
        strategy,
        config.routing.rules.clone(),
    ));
    let ceiling = config.request_ceiling;

    AppState {
        registry,
        router,
        chain,
        authenticator,
        bus,
        config: Arc::new(RwLock::new(config)),
        paths: ConfigPaths::new(config_dir),
        started: Instant::now(),
        ceiling: Arc::new(Semaphore::new(ceiling)),
        cancel: CancellationToken::new(),
    }
}

/// App + state over a fresh temp dir.
pub fn open_app(dir: &tempfile::TempDir) -> (axum::Router, AppState) {
    let state = build_state(open_config(), dir.path());
    (build_app(state.clone()), state)
}

/// Writes a POSIX-sh JSON-RPC responder that answers every request with
/// `{"result":{"ok":true}}` under the request's own id (numeric or string).
pub fn responder_script(dir: &Path) -> PathBuf {
    let path = dir.join("responder.sh");
    let script = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","result":{"ok":true},"id":%s}\n' "$id"
    continue
  fi
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","result":{"ok":true},"id":"%s"}\n' "$id"
  fi
done
"#;
    std::fs::write(&path, script).expect("write responder script");
    path
}

/// Serializes a JSON body into a request.
pub fn json_request(method: &str, uri: &str, body: &Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Empty-bodied request.
pub fn bare_request(method: &str, uri: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

/// Reads a response body as JSON.
pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("body is JSON")
}
