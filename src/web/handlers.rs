//! Endpoint handlers for the HTTP surface.
//!
//! Handlers stay thin: parse, call into the registry/router, map errors to
//! the standard envelope. The tool stages of the middleware chain run here
//! (the pre-stages already ran in the gate layer) so the security guard
//! sees request params and tool results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::{ApiError, ApiResult, AppState};
use crate::config::{GatewayConfig, ServiceTemplate, save_gateway_config, save_template};
use crate::error::GatewayError;
use crate::middleware::auth::{HANDSHAKE_TTL, TOKEN_TTL};
use crate::middleware::{
    ChainState, Stage, VAL_GROUP, VAL_INSTANCE, VAL_METHOD, VAL_PARAMS, VAL_RESULT,
};
use crate::observability::metrics;
use crate::registry::{InstanceMode, InstanceOverrides, ServiceInstance};
use crate::router::RouteRequest;
use crate::transport::{JsonRpcRequest, TransportKind};

type SharedChainState = Arc<Mutex<ChainState>>;

/// Instance view returned by the services endpoints; the frozen config's
/// resolved env never leaves the process.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    /// Instance id.
    pub id: String,
    /// Template name (routing group).
    pub template: String,
    /// Transport kind.
    pub transport: TransportKind,
    /// Lifecycle state.
    pub state: crate::registry::InstanceState,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Failures recorded.
    pub error_count: u32,
    /// Metadata annotations.
    pub metadata: BTreeMap<String, Value>,
}

impl From<ServiceInstance> for ServiceView {
    fn from(instance: ServiceInstance) -> Self {
        Self {
            id: instance.id,
            template: instance.template,
            transport: instance.config.transport,
            state: instance.state,
            started_at: instance.started_at,
            error_count: instance.error_count,
            metadata: instance.metadata,
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health` — always 200 while the process is reachable.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.registry.get_registry_stats();
    metrics::set_uptime(state.started.elapsed());
    Json(json!({
        "status": "ok",
        "uptimeMs": state.started.elapsed().as_millis() as u64,
        "templates": stats.templates,
        "instances": stats.instances,
        "healthy": stats.healthy_instances,
    }))
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// `GET /api/templates`.
pub async fn list_templates(State(state): State<AppState>) -> Json<Vec<ServiceTemplate>> {
    Json(state.registry.list_templates().iter().map(|t| (**t).clone()).collect())
}

/// `POST /api/templates`.
pub async fn create_template(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let template: ServiceTemplate = serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid template: {e}")))?;
    let name = template.name.clone();
    let changed = state.registry.register_template(template.clone())?;
    if changed {
        save_template(&state.paths.templates_dir(), &template)?;
    }
    Ok((StatusCode::CREATED, Json(json!({ "name": name, "changed": changed }))))
}

/// `DELETE /api/templates/{name}` — idempotent.
pub async fn delete_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<Value> {
    let removed = state.registry.remove_template(&name);
    crate::config::delete_template(&state.paths.templates_dir(), &name);
    Json(json!({ "removed": removed }))
}

/// `PATCH /api/templates/{name}/env` — merges env keys into a replacement.
pub async fn patch_template_env(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(env): Json<BTreeMap<String, String>>,
) -> ApiResult<Json<ServiceTemplate>> {
    let template = state
        .registry
        .get_template(&name)
        .ok_or_else(|| GatewayError::NotFound(format!("template {name}")))?;
    let mut updated = (*template).clone();
    for (key, value) in env {
        updated.env.insert(key, value);
    }
    state.registry.register_template(updated.clone())?;
    save_template(&state.paths.templates_dir(), &updated)?;
    Ok(Json(updated))
}

/// `POST /api/templates/{name}/diagnose` — sandbox dry-run without launch.
pub async fn diagnose_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let template = state
        .registry
        .get_template(&name)
        .ok_or_else(|| GatewayError::NotFound(format!("template {name}")))?;

    let policy = state.registry.sandbox();
    let effective = policy.apply_trust(&template);
    let mut findings = Vec::new();

    fn check(
        findings: &mut Vec<Value>,
        name: &str,
        outcome: Result<String, GatewayError>,
    ) {
        match outcome {
            Ok(detail) => findings.push(json!({ "check": name, "ok": true, "detail": detail })),
            Err(e) => findings.push(json!({ "check": name, "ok": false, "detail": e.to_string() })),
        }
    }

    check(
        &mut findings,
        "validate",
        effective.validate().map(|()| "template is structurally valid".into()),
    );
    if effective.transport != template.transport {
        findings.push(json!({
            "check": "trust-rewrite",
            "ok": true,
            "detail": format!("would launch as {} transport", effective.transport),
        }));
    }
    match effective.transport {
        TransportKind::Stdio | TransportKind::Container => {
            let command = effective.command.clone().unwrap_or_default();
            check(
                &mut findings,
                "command",
                policy
                    .validate_command(&command, &effective.args)
                    .map(|()| "command line passes validation".into()),
            );
            let lookup = if effective.transport == TransportKind::Container {
                policy.container_runtime.as_str()
            } else {
                command.as_str()
            };
            check(
                &mut findings,
                "executable",
                policy
                    .resolve_executable(lookup)
                    .map(|p| format!("resolves to {}", p.display())),
            );
            if let Some(container) = &effective.container {
                check(
                    &mut findings,
                    "volumes",
                    policy
                        .validate_volumes(&container.volumes)
                        .map(|()| format!("{} mount(s) allowed", container.volumes.len())),
                );
            }
        }
        TransportKind::Http | TransportKind::Sse => {
            check(
                &mut findings,
                "url",
                effective
                    .url
                    .clone()
                    .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
                    .ok_or_else(|| GatewayError::Validation("url must be http(s)".into()))
                    .map(|u| format!("endpoint {u}")),
            );
        }
    }

    let ok = findings.iter().all(|f| f["ok"] == json!(true));
    Ok(Json(json!({ "ok": ok, "findings": findings })))
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Body of `POST /api/services`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceBody {
    /// Template to instantiate.
    pub template_name: String,
    /// Optional overrides.
    #[serde(default)]
    pub instance_args: Option<InstanceOverrides>,
    /// Lifecycle mode; defaults to keep-alive.
    #[serde(default)]
    pub mode: Option<InstanceMode>,
}

/// `GET /api/services`.
pub async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceView>> {
    Json(state.registry.list_instances().into_iter().map(ServiceView::from).collect())
}

/// `POST /api/services`.
pub async fn create_service(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let body: CreateServiceBody = serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid request: {e}")))?;
    let instance = state.registry.create_instance(
        &body.template_name,
        &body.instance_args.unwrap_or_default(),
        body.mode.unwrap_or_default(),
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "serviceId": instance.id }))))
}

/// `GET /api/services/{id}`.
pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceView>> {
    state
        .registry
        .get_instance(&id)
        .map(|i| Json(ServiceView::from(i)))
        .ok_or_else(|| ApiError(GatewayError::NotFound(format!("instance {id}"))))
}

/// `DELETE /api/services/{id}`.
pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.registry.remove_instance(&id).await?;
    Ok(Json(json!({ "removed": true })))
}

/// Query of `GET /api/services/{id}/health`.
#[derive(Debug, Default, Deserialize)]
pub struct HealthQuery {
    /// Run a live probe instead of returning the passive snapshot.
    #[serde(default)]
    pub probe: bool,
}

/// `GET /api/services/{id}/health`.
pub async fn service_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HealthQuery>,
) -> ApiResult<Json<Value>> {
    let instance = state
        .registry
        .get_instance(&id)
        .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;

    let live = if query.probe {
        Some(state.registry.check_health(&id).await?)
    } else {
        None
    };
    Ok(Json(json!({
        "serviceId": id,
        "state": instance.state,
        "snapshot": state.registry.health_snapshot(&id),
        "probe": live,
    })))
}

/// Query of `GET /api/services/{id}/logs`.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Maximum lines returned, newest last.
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

const fn default_log_limit() -> usize {
    100
}

/// `GET /api/services/{id}/logs?limit=N`.
pub async fn service_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    if state.registry.get_instance(&id).is_none() {
        return Err(ApiError(GatewayError::NotFound(format!("instance {id}"))));
    }
    Ok(Json(json!({ "lines": state.registry.logs(&id, query.limit) })))
}

/// `PATCH /api/services/{id}/env`.
pub async fn patch_service_env(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(env): Json<BTreeMap<String, String>>,
) -> ApiResult<Json<Value>> {
    state.registry.patch_instance_env(&id, &env)?;
    Ok(Json(json!({ "patched": env.len(), "note": "applies on next connect" })))
}

// ---------------------------------------------------------------------------
// Routing & proxy
// ---------------------------------------------------------------------------

/// `POST /api/route` — selection only, no dispatch.
pub async fn route(
    State(state): State<AppState>,
    Extension(chain_state): Extension<SharedChainState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let request: RouteRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid route request: {e}")))?;
    metrics::record_request(&request.method);
    let started = Instant::now();

    let (instance, decision) = state.router.route(&request)?;

    // Tool-stage middlewares see the selection and may veto the params.
    {
        let mut cs = chain_state.lock().await;
        cs.set(VAL_METHOD, json!(request.method));
        cs.set(VAL_GROUP, json!(decision.group));
        if let Some(params) = &request.params {
            cs.set(VAL_PARAMS, params.clone());
        }
        cs.set(VAL_INSTANCE, json!(instance.id));
        state.chain.run_stage(Stage::BeforeTool, &mut cs, &state.cancel).await?;
    }

    metrics::record_request_duration(&request.method, started.elapsed());
    Ok(Json(json!({
        "selectedService": ServiceView::from(instance),
        "routingDecision": decision,
    })))
}

/// `POST /api/proxy/{serviceId}` — relays the envelope, returns the reply.
pub async fn proxy(
    State(state): State<AppState>,
    Extension(chain_state): Extension<SharedChainState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let envelope: JsonRpcRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::Protocol(format!("invalid JSON-RPC envelope: {e}")))?;
    metrics::record_request(&envelope.method);
    let started = Instant::now();

    {
        let mut cs = chain_state.lock().await;
        cs.set(VAL_METHOD, json!(envelope.method));
        if let Some(params) = &envelope.params {
            cs.set(VAL_PARAMS, params.clone());
        }
        cs.set(VAL_INSTANCE, json!(id));
        state.chain.run_stage(Stage::BeforeTool, &mut cs, &state.cancel).await?;
    }

    let method = envelope.method.clone();
    let outcome = state.router.proxy(&id, envelope, None, &state.cancel).await;
    metrics::record_proxy(&method, outcome.is_ok());
    let reply = outcome?;

    // The reply is relayed verbatim modulo the security guard's redaction.
    let mut cs = chain_state.lock().await;
    cs.set(VAL_RESULT, serde_json::to_value(&reply).map_err(GatewayError::from)?);
    state.chain.run_stage(Stage::AfterTool, &mut cs, &state.cancel).await?;
    let body = cs.values.remove(VAL_RESULT).unwrap_or(Value::Null);

    metrics::record_request_duration(&method, started.elapsed());
    Ok(Json(body))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `GET /api/config`.
pub async fn get_config(State(state): State<AppState>) -> Json<GatewayConfig> {
    Json(state.config.read().expect("config lock poisoned").clone())
}

/// `PUT /api/config` — validates, persists atomically, swaps in memory.
pub async fn put_config(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let config: GatewayConfig = serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid gateway config: {e}")))?;
    config.validate()?;
    save_gateway_config(&state.paths.gateway_file(), &config)?;
    *state.config.write().expect("config lock poisoned") = config;
    Ok(Json(json!({
        "applied": true,
        "note": "listener, sandbox, and auth changes take effect on restart",
    })))
}

// ---------------------------------------------------------------------------
// Handshake pairing
// ---------------------------------------------------------------------------

/// Body of `POST /auth/handshake/start`.
#[derive(Debug, Deserialize)]
pub struct HandshakeStartBody {
    /// Browser origin requesting access.
    pub origin: String,
}

/// `POST /auth/handshake/start`.
pub async fn handshake_start(
    State(state): State<AppState>,
    Json(body): Json<HandshakeStartBody>,
) -> ApiResult<Json<Value>> {
    if !state.authenticator.origin_allowed(&body.origin) {
        return Err(ApiError(GatewayError::Forbidden(format!(
            "origin {} may not pair",
            body.origin
        ))));
    }
    let (handshake_id, nonce) = state.authenticator.handshake().start(&body.origin);
    Ok(Json(json!({
        "handshakeId": handshake_id,
        "nonce": nonce,
        "expiresInMs": HANDSHAKE_TTL.as_millis() as u64,
    })))
}

/// Body of `POST /auth/handshake/complete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeCompleteBody {
    /// Id returned by `start`.
    pub handshake_id: String,
    /// Same origin that started the handshake.
    pub origin: String,
    /// Base64 HMAC proof over the pairing code.
    pub proof: String,
}

/// `POST /auth/handshake/complete`.
pub async fn handshake_complete(
    State(state): State<AppState>,
    Json(body): Json<HandshakeCompleteBody>,
) -> ApiResult<Json<Value>> {
    let token = state
        .authenticator
        .handshake()
        .complete(&body.handshake_id, &body.origin, &body.proof)?;
    Ok(Json(json!({
        "token": token,
        "expiresInMs": TOKEN_TTL.as_millis() as u64,
    })))
}
