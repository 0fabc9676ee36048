//! HTTP surface.
//!
//! One axum server exposes the whole public API. A gate layer in front of
//! `/api/*` enforces the request ceiling and runs the pre-stages of the
//! middleware chain (authentication, rate limiting); the route/proxy
//! handlers run the tool stages around the router. `/health` and the
//! handshake endpoints are reachable without credentials.

pub mod handlers;
pub mod sse;

use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::{ConfigPaths, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::events::EventBus;
use crate::middleware::{
    Authenticator, ChainState, MiddlewareChain, Stage, VAL_API_KEY, VAL_AUTHORIZATION, VAL_ORIGIN,
};
use crate::registry::ServiceRegistry;
use crate::router::Router as RequestRouter;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Service registry.
    pub registry: ServiceRegistry,
    /// Request router.
    pub router: Arc<RequestRouter>,
    /// Middleware chain run around each request.
    pub chain: MiddlewareChain,
    /// Credential validator (also serves the handshake endpoints).
    pub authenticator: Arc<Authenticator>,
    /// Event bus feeding the SSE hub.
    pub bus: EventBus,
    /// Live gateway config; PUT /api/config swaps it.
    pub config: Arc<RwLock<GatewayConfig>>,
    /// Config directory layout for persistence.
    pub paths: ConfigPaths,
    /// Process start, for uptime reporting.
    pub started: Instant,
    /// Request ceiling; exhausted permits fail fast with `Overloaded`.
    pub ceiling: Arc<Semaphore>,
    /// Root shutdown token.
    pub cancel: CancellationToken,
}

/// JSON error envelope produced from a [`GatewayError`].
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = axum::http::StatusCode::from_u16(err.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);

        let meta = match &err {
            GatewayError::Middleware {
                stage, middleware, ..
            } => Some(json!({ "stage": stage, "middleware": middleware })),
            GatewayError::Routing {
                group, strategy, ..
            } => Some(json!({ "group": group, "strategy": strategy })),
            GatewayError::RateLimited { retry_after_ms } => {
                Some(json!({ "retryAfterMs": retry_after_ms }))
            }
            GatewayError::BreakerOpen { instance } => Some(json!({ "instance": instance })),
            _ => None,
        };

        let mut body = json!({
            "code": err.code(),
            "message": err.to_string(),
            "recoverable": err.recoverable(),
        });
        if let Some(meta) = meta {
            body["meta"] = meta;
        }

        let mut response = (status, axum::Json(body)).into_response();
        if let GatewayError::RateLimited { retry_after_ms } = err.root() {
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Gate layer for `/api/*`: request ceiling plus the chain's pre-stages.
async fn gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    // Fail fast rather than queue unboundedly.
    let Ok(_permit) = Arc::clone(&state.ceiling).try_acquire_owned() else {
        return ApiError(GatewayError::Overloaded).into_response();
    };

    let mut chain_state = ChainState::new();
    for (key, header) in [
        (VAL_AUTHORIZATION, "authorization"),
        (VAL_API_KEY, "x-api-key"),
        (VAL_ORIGIN, "origin"),
    ] {
        if let Some(value) = request.headers().get(header).and_then(|v| v.to_str().ok()) {
            chain_state.set(key, json!(value));
        }
    }

    for stage in [Stage::BeforeAgent, Stage::BeforeModel, Stage::AfterModel] {
        if let Err(e) = state.chain.run_stage(stage, &mut chain_state, &state.cancel).await {
            return ApiError(e).into_response();
        }
    }

    let shared = Arc::new(tokio::sync::Mutex::new(chain_state));
    request.extensions_mut().insert(Arc::clone(&shared));
    let response = next.run(request).await;

    let mut chain_state = shared.lock().await;
    if let Err(e) = state
        .chain
        .run_stage(Stage::AfterAgent, &mut chain_state, &state.cancel)
        .await
    {
        warn!(error = %e, "after_agent stage failed");
    }
    response
}

/// Builds the full axum application.
#[must_use]
pub fn build_app(state: AppState) -> axum::Router {
    let cors = cors_layer(&state.config.read().expect("config lock poisoned").cors);

    let api = axum::Router::new()
        .route(
            "/api/templates",
            get(handlers::list_templates).post(handlers::create_template),
        )
        .route("/api/templates/{name}", axum::routing::delete(handlers::delete_template))
        .route("/api/templates/{name}/env", axum::routing::patch(handlers::patch_template_env))
        .route("/api/templates/{name}/diagnose", post(handlers::diagnose_template))
        .route(
            "/api/services",
            get(handlers::list_services).post(handlers::create_service),
        )
        .route(
            "/api/services/{id}",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route("/api/services/{id}/health", get(handlers::service_health))
        .route("/api/services/{id}/logs", get(handlers::service_logs))
        .route("/api/services/{id}/env", axum::routing::patch(handlers::patch_service_env))
        .route("/api/route", post(handlers::route))
        .route("/api/proxy/{id}", post(handlers::proxy))
        .route("/api/events", get(sse::events))
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::put_config),
        )
        .layer(axum::middleware::from_fn_with_state(state.clone(), gate));

    axum::Router::new()
        .route("/health", get(handlers::health))
        .route("/auth/handshake/start", post(handlers::handshake_start))
        .route("/auth/handshake/complete", post(handlers::handshake_complete))
        .merge(api)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &crate::config::CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        CorsLayer::new()
    } else if config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Binds and serves until the cancellation token trips.
///
/// # Errors
///
/// I/O errors from bind or accept loops.
pub async fn serve(state: AppState, host: &str, port: u16) -> Result<()> {
    let cancel = state.cancel.clone();
    let app = build_app(state);
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP surface listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
