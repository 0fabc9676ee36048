//! Service registry: the composition root of the service plane.
//!
//! Owns the template registry, instance manager, health monitor, breaker
//! set, balancer, and the live adapters, and exposes the public surface the
//! router and the HTTP layer call. Lifecycle events flow out through the
//! event bus; nothing in here ever calls back into a subscriber.

pub mod health;
pub mod instances;
pub mod templates;

pub use health::{HealthAggregates, HealthFlip, HealthMonitor, HealthSnapshot, ProbeOutcome};
pub use instances::{
    InstanceManager, InstanceMode, InstanceState, META_LAST_PROBE_ERROR, META_MODE, META_WEIGHT,
    ServiceInstance,
};
pub use templates::TemplateRegistry;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balancer::{Candidate, LoadBalancer, Strategy};
use crate::breaker::BreakerSet;
use crate::config::schema::{HealthSpec, ServiceTemplate, resolve_env_ref};
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::observability::metrics;
use crate::transport::sandbox::{SandboxPolicy, build_stdio_launch};
use crate::transport::{
    Adapter, AdapterEvent, HttpAdapter, JsonRpcRequest, SseAdapter, StdioAdapter, TransportKind,
    container::build_container_launch,
};

/// Capacity of each instance's in-memory log ring.
const LOG_RING_CAPACITY: usize = 512;

/// Backoff cap for initial-connect retries.
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Caller-supplied tweaks applied on top of a template at instance creation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceOverrides {
    /// Replaces the template args entirely when present.
    #[serde(default)]
    pub args: Option<Vec<String>>,
    /// Merged over the template env.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Balancer weight.
    #[serde(default)]
    pub weight: Option<u32>,
    /// Per-call deadline override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// One line in an instance's log ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    /// When the line was recorded.
    pub timestamp: DateTime<Utc>,
    /// Where it came from: `stderr`, `lifecycle`, or `notification`.
    pub source: &'static str,
    /// The line itself.
    pub line: String,
}

/// Counters exposed by `getRegistryStats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    /// Stored templates.
    pub templates: usize,
    /// Live instances.
    pub instances: usize,
    /// Instances currently healthy.
    pub healthy_instances: usize,
    /// Instance counts keyed by state.
    pub by_state: BTreeMap<String, usize>,
}

struct RegistryInner {
    templates: TemplateRegistry,
    instances: InstanceManager,
    health: Arc<HealthMonitor>,
    breakers: BreakerSet,
    balancer: LoadBalancer,
    adapters: DashMap<String, Arc<dyn Adapter>>,
    connect_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    logs: DashMap<String, Mutex<VecDeque<LogLine>>>,
    forwarders: DashMap<String, tokio::task::JoinHandle<()>>,
    sandbox: SandboxPolicy,
    bus: EventBus,
}

/// Cloneable handle to the registry.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    /// Creates a registry wired to the given sandbox policy and event bus,
    /// with default breaker and balancer tuning.
    #[must_use]
    pub fn new(sandbox: SandboxPolicy, bus: EventBus) -> Self {
        Self::with_settings(
            sandbox,
            bus,
            crate::breaker::BreakerConfig::default(),
            crate::balancer::BalancerConfig::default(),
        )
    }

    /// Creates a registry with explicit breaker and balancer tuning.
    #[must_use]
    pub fn with_settings(
        sandbox: SandboxPolicy,
        bus: EventBus,
        breaker: crate::breaker::BreakerConfig,
        balancer: crate::balancer::BalancerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                templates: TemplateRegistry::new(),
                instances: InstanceManager::new(),
                health: Arc::new(HealthMonitor::new()),
                breakers: BreakerSet::new(breaker),
                balancer: LoadBalancer::new(balancer),
                adapters: DashMap::new(),
                connect_locks: DashMap::new(),
                logs: DashMap::new(),
                forwarders: DashMap::new(),
                sandbox,
                bus,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Validates and stores a template.
    ///
    /// # Errors
    ///
    /// `Validation` when the template fails its invariants.
    pub fn register_template(&self, template: ServiceTemplate) -> Result<bool> {
        let changed = self.inner.templates.register(template)?;
        Ok(changed)
    }

    /// Returns one template by name.
    #[must_use]
    pub fn get_template(&self, name: &str) -> Option<Arc<ServiceTemplate>> {
        self.inner.templates.get(name)
    }

    /// All templates, sorted by name.
    #[must_use]
    pub fn list_templates(&self) -> Vec<Arc<ServiceTemplate>> {
        self.inner.templates.list()
    }

    /// Removes a template; existing instances keep their frozen configs and
    /// continue running. Returns `false` for unknown names.
    pub fn remove_template(&self, name: &str) -> bool {
        self.inner.templates.remove(name)
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Creates an instance of a template: resolves `${NAME}` references,
    /// applies the sandbox policy (including the trust-tier rewrite),
    /// freezes the result, and starts health monitoring unless managed.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown templates, `Validation`/`Forbidden` from the
    /// sandbox gates.
    pub fn create_instance(
        &self,
        template_name: &str,
        overrides: &InstanceOverrides,
        mode: InstanceMode,
    ) -> Result<ServiceInstance> {
        let template = self
            .get_template(template_name)
            .ok_or_else(|| GatewayError::NotFound(format!("template {template_name}")))?;

        let mut resolved = (*template).clone();
        if let Some(args) = &overrides.args {
            resolved.args.clone_from(args);
        }
        for (key, value) in &overrides.env {
            resolved.env.insert(key.clone(), value.clone());
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            resolved.timeout_ms = timeout_ms;
        }

        // Reference resolution happens exactly once, here.
        resolved.args = resolved.args.iter().map(|a| resolve_env_ref(a)).collect();
        resolved.env = resolved
            .env
            .iter()
            .map(|(k, v)| (k.clone(), resolve_env_ref(v)))
            .collect();

        let resolved = self.inner.sandbox.apply_trust(&resolved);
        resolved.validate()?;
        match resolved.transport {
            TransportKind::Stdio => {
                build_stdio_launch(&resolved, &self.inner.sandbox)?;
            }
            TransportKind::Container => {
                build_container_launch(&resolved, &self.inner.sandbox)?;
            }
            TransportKind::Http | TransportKind::Sse => {}
        }

        let instance = self.inner.instances.create(template_name, resolved, mode);
        if let Some(weight) = overrides.weight {
            self.inner
                .instances
                .set_metadata(&instance.id, META_WEIGHT, json!(weight))?;
        }

        self.inner.logs.insert(
            instance.id.clone(),
            Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
        );
        self.push_log(&instance.id, "lifecycle", format!("instance created from {template_name}"));
        self.inner.balancer.mark_healthy(&instance.id);

        if mode == InstanceMode::KeepAlive {
            self.start_monitoring(&instance.id, instance.config.health.as_ref());
        }

        metrics::set_instances(self.inner.instances.count());
        self.inner.bus.publish(Event::with_id(
            EventKind::ServiceCreated,
            format!("created-{}", instance.id),
            json!({ "serviceId": instance.id, "template": template_name }),
        ));
        info!(instance = %instance.id, template = template_name, "instance created");
        Ok(self.inner.instances.get(&instance.id).unwrap_or(instance))
    }

    /// Stops monitoring, removes from the balancer, disconnects any adapter,
    /// and deletes the instance.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub async fn remove_instance(&self, id: &str) -> Result<()> {
        let instance = self
            .inner
            .instances
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;

        // Best-effort walk through stopping; terminal states stay put.
        if !instance.state.is_terminal() {
            let _ = self.inner.instances.update_state(id, InstanceState::Stopping);
        }

        self.inner.health.stop_monitoring(id);
        self.inner.balancer.remove(id);
        self.inner.breakers.remove(id);
        if let Some((_, task)) = self.inner.forwarders.remove(id) {
            task.abort();
        }
        if let Some((_, adapter)) = self.inner.adapters.remove(id) {
            if let Err(e) = adapter.disconnect().await {
                warn!(instance = id, error = %e, "adapter teardown failed");
            }
        }
        let _ = self.inner.instances.update_state(id, InstanceState::Stopped);
        self.inner.instances.remove(id);
        self.inner.logs.remove(id);
        self.inner.connect_locks.remove(id);

        metrics::set_instances(self.inner.instances.count());
        self.inner.bus.publish(Event::with_id(
            EventKind::ServiceStopped,
            format!("stopped-{id}"),
            json!({ "serviceId": id, "template": instance.template }),
        ));
        info!(instance = id, "instance removed");
        Ok(())
    }

    /// Clone of one instance.
    #[must_use]
    pub fn get_instance(&self, id: &str) -> Option<ServiceInstance> {
        self.inner.instances.get(id)
    }

    /// Clones of all instances.
    #[must_use]
    pub fn list_instances(&self) -> Vec<ServiceInstance> {
        self.inner.instances.list()
    }

    /// Clones of one template's instances.
    #[must_use]
    pub fn get_instances_by_template(&self, template: &str) -> Vec<ServiceInstance> {
        self.inner.instances.list_by_template(template)
    }

    /// Instances that are running (or degraded-but-last-resort excluded)
    /// and whose latest health observation is not failing.
    #[must_use]
    pub fn get_healthy_instances(&self, template: Option<&str>) -> Vec<ServiceInstance> {
        let pool = template.map_or_else(|| self.list_instances(), |t| self.get_instances_by_template(t));
        pool.into_iter()
            .filter(|i| {
                i.state == InstanceState::Running
                    && self.inner.health.is_healthy(&i.id).unwrap_or(true)
            })
            .collect()
    }

    /// Creates or removes instances until `template` has `target` of them.
    ///
    /// Surplus instances are removed newest-first.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown templates; creation errors propagate.
    pub async fn scale_template(&self, template: &str, target: usize) -> Result<Vec<String>> {
        if !self.inner.templates.contains(template) {
            return Err(GatewayError::NotFound(format!("template {template}")));
        }
        let mut current = self.get_instances_by_template(template);
        while current.len() < target {
            self.create_instance(template, &InstanceOverrides::default(), InstanceMode::KeepAlive)?;
            current = self.get_instances_by_template(template);
        }
        while current.len() > target {
            // Ids sort by creation time, so the last one is the newest.
            let victim = current.pop().map(|i| i.id).expect("non-empty");
            self.remove_instance(&victim).await?;
        }
        Ok(current.into_iter().map(|i| i.id).collect())
    }

    /// Picks the best instance of a group under a strategy without routing
    /// a request through it.
    ///
    /// # Errors
    ///
    /// `NoServiceAvailable` when the group has no instances.
    pub fn select_best_instance(
        &self,
        template: &str,
        strategy: Strategy,
    ) -> Result<ServiceInstance> {
        let candidates = self.candidates(template);
        let chosen = self
            .inner
            .balancer
            .select(template, strategy, &candidates)
            .ok_or_else(|| GatewayError::NoServiceAvailable { group: template.to_string() })?;
        self.get_instance(&chosen)
            .ok_or_else(|| GatewayError::NoServiceAvailable { group: template.to_string() })
    }

    /// Balancer selection over an externally shaped candidate set (the
    /// router filters before calling this).
    #[must_use]
    pub fn select(&self, group: &str, strategy: Strategy, candidates: &[Candidate]) -> Option<String> {
        self.inner.balancer.select(group, strategy, candidates)
    }

    /// Candidate view of a group for balancer selection.
    #[must_use]
    pub fn candidates(&self, template: &str) -> Vec<Candidate> {
        self.get_instances_by_template(template)
            .into_iter()
            .map(|i| Candidate {
                running: i.state == InstanceState::Running,
                health_ok: self.inner.health.is_healthy(&i.id).unwrap_or(true),
                breaker_open: self.inner.breakers.is_open(&i.id),
                weight: i.weight(),
                id: i.id,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Adapters
    // ------------------------------------------------------------------

    /// Borrows the live adapter for an instance, connecting it first if
    /// needed. The first use drives `idle → starting → running`; a connect
    /// failure after the template's retry budget drives `starting → error`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; transport errors when connecting fails.
    pub async fn adapter(&self, id: &str) -> Result<Arc<dyn Adapter>> {
        if let Some(adapter) = self.inner.adapters.get(id) {
            return Ok(Arc::clone(&adapter));
        }

        let lock = self
            .inner
            .connect_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Someone else may have connected while we waited.
        if let Some(adapter) = self.inner.adapters.get(id) {
            return Ok(Arc::clone(&adapter));
        }

        let instance = self
            .inner
            .instances
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        if instance.state.is_terminal() {
            return Err(GatewayError::Conflict(format!(
                "instance {id} is {} and cannot serve",
                instance.state
            )));
        }

        let adapter = self.build_adapter(&instance)?;
        // Subscribe before connect so spawn-time stderr is not lost.
        self.spawn_event_forwarder(id, adapter.as_ref());
        if instance.state == InstanceState::Idle {
            self.inner.instances.update_state(id, InstanceState::Starting)?;
        }

        let mut attempt: u32 = 0;
        let connected = loop {
            match adapter.connect().await {
                Ok(()) => break Ok(()),
                Err(e) if attempt < instance.config.retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(16)))
                        .min(CONNECT_BACKOFF_CAP);
                    warn!(instance = id, %e, attempt, "connect failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => break Err(e),
            }
        };

        match connected {
            Ok(()) => {
                let _ = self.inner.instances.update_state(id, InstanceState::Running);
                self.push_log(id, "lifecycle", "adapter connected".to_string());
                self.inner.adapters.insert(id.to_string(), Arc::clone(&adapter));
                Ok(adapter)
            }
            Err(e) => {
                if let Some((_, task)) = self.inner.forwarders.remove(id) {
                    task.abort();
                }
                let _ = self.inner.instances.increment_error_count(id);
                let _ = self.inner.instances.update_state(id, InstanceState::Error);
                self.push_log(id, "lifecycle", format!("connect failed: {e}"));
                Err(e)
            }
        }
    }

    /// Builds the concrete adapter for an instance's frozen config.
    fn build_adapter(&self, instance: &ServiceInstance) -> Result<Arc<dyn Adapter>> {
        let config = &instance.config;
        let adapter: Arc<dyn Adapter> = match config.transport {
            TransportKind::Stdio => {
                let launch = build_stdio_launch(config, &self.inner.sandbox)?;
                Arc::new(StdioAdapter::new(
                    &instance.id,
                    TransportKind::Stdio,
                    launch,
                    &config.protocol_version,
                ))
            }
            TransportKind::Container => {
                let launch = build_container_launch(config, &self.inner.sandbox)?;
                Arc::new(StdioAdapter::new(
                    &instance.id,
                    TransportKind::Container,
                    launch,
                    &config.protocol_version,
                ))
            }
            TransportKind::Http => Arc::new(HttpAdapter::new(
                &instance.id,
                config.url.clone().unwrap_or_default(),
                config.headers.clone(),
                &config.protocol_version,
            )),
            TransportKind::Sse => Arc::new(SseAdapter::new(
                &instance.id,
                config.url.clone().unwrap_or_default(),
                config.headers.clone(),
                &config.protocol_version,
            )),
        };
        Ok(adapter)
    }

    /// Forwards adapter events into the bus and the instance log ring.
    fn spawn_event_forwarder(&self, id: &str, adapter: &dyn Adapter) {
        let mut events = adapter.subscribe_events();
        let weak = Arc::downgrade(&self.inner);
        let id_owned = id.to_string();
        let id = id_owned.clone();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AdapterEvent::Stderr { line }) => {
                        let Some(inner) = weak.upgrade() else { break };
                        push_log_inner(&inner, &id, "stderr", line.clone());
                        inner.bus.publish(Event::new(
                            EventKind::Stderr,
                            json!({ "serviceId": id, "line": line }),
                        ));
                    }
                    Ok(AdapterEvent::Notification(notif)) => {
                        let Some(inner) = weak.upgrade() else { break };
                        push_log_inner(
                            &inner,
                            &id,
                            "notification",
                            format!("notification {}", notif.method),
                        );
                        inner.bus.publish(Event::new(
                            EventKind::Message,
                            json!({ "serviceId": id, "method": notif.method, "params": notif.params }),
                        ));
                    }
                    Ok(AdapterEvent::Closed { reason }) => {
                        let Some(inner) = weak.upgrade() else { break };
                        push_log_inner(&inner, &id, "lifecycle", format!("channel closed: {reason}"));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(instance = %id, skipped, "event forwarder lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.inner.forwarders.insert(id_owned, task) {
            previous.abort();
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    fn start_monitoring(&self, id: &str, spec: Option<&HealthSpec>) {
        let spec = spec.cloned().unwrap_or_default();
        let interval = Duration::from_millis(spec.interval_ms.max(1));
        let probe_timeout = Duration::from_millis(spec.timeout_ms.max(1));
        let method = spec.method;

        let weak = Arc::downgrade(&self.inner);
        let probe_id = id.to_string();
        let probe: health::ProbeFn = Arc::new(move || {
            let weak = weak.clone();
            let id = probe_id.clone();
            let method = method.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err("registry shut down".to_string());
                };
                let registry = ServiceRegistry { inner };
                registry
                    .probe_once(&id, &method, probe_timeout)
                    .await
                    .map_err(|e| e.to_string())
            })
        });

        self.inner
            .health
            .start_monitoring(id, interval, probe, self.flip_callback());
    }

    /// One probe exchange; also used by `check_health`.
    async fn probe_once(&self, id: &str, method: &str, timeout: Duration) -> Result<f64> {
        let adapter = self.adapter(id).await?;
        let request = JsonRpcRequest::new(
            method,
            None,
            Value::String(format!("probe-{}", uuid::Uuid::new_v4().simple())),
        );
        let started = Instant::now();
        let outcome = adapter
            .send_and_receive(request, timeout, &CancellationToken::new())
            .await;
        match outcome {
            Ok(reply) => {
                if let Some(err) = reply.error {
                    let failure = GatewayError::BackendError {
                        code: err.code,
                        message: err.message,
                    };
                    self.note_probe_failure(id, &failure);
                    Err(failure)
                } else {
                    Ok(started.elapsed().as_secs_f64() * 1000.0)
                }
            }
            Err(e) => {
                self.note_probe_failure(id, &e);
                Err(e)
            }
        }
    }

    fn note_probe_failure(&self, id: &str, error: &GatewayError) {
        let text = error.to_string();
        let _ = self
            .inner
            .instances
            .set_metadata(id, META_LAST_PROBE_ERROR, Value::String(text.clone()));
        metrics::record_probe_failure();
        self.inner.bus.publish(Event::new(
            EventKind::ProbeFailed,
            json!({ "serviceId": id, "error": text }),
        ));
    }

    /// The callback health flips arrive through.
    fn flip_callback(&self) -> health::FlipFn {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |id: &str, flip: HealthFlip, error: Option<String>| {
            let Some(inner) = weak.upgrade() else { return };
            let (from, to, healthy) = match flip {
                HealthFlip::Degraded => (InstanceState::Running, InstanceState::Degraded, false),
                HealthFlip::Recovered => (InstanceState::Degraded, InstanceState::Running, true),
            };
            let current = inner.instances.get(id).map(|i| i.state);
            if current == Some(from) {
                if let Err(e) = inner.instances.update_state(id, to) {
                    warn!(instance = id, error = %e, "health flip transition refused");
                }
            }
            if healthy {
                inner.balancer.mark_healthy(id);
                let _ = inner.instances.set_metadata(id, META_LAST_PROBE_ERROR, Value::Null);
            }
            inner.bus.publish(Event::new(
                EventKind::ServiceHealthChanged,
                json!({
                    "serviceId": id,
                    "healthy": healthy,
                    "error": error,
                }),
            ));
        })
    }

    /// Runs one probe right now, outside the timer.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; probe failures propagate.
    pub async fn check_health(&self, id: &str) -> Result<ProbeOutcome> {
        let instance = self
            .inner
            .instances
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        let spec = instance.config.health.clone().unwrap_or_default();
        match self
            .probe_once(id, &spec.method, Duration::from_millis(spec.timeout_ms))
            .await
        {
            Ok(latency) => Ok(ProbeOutcome::ok(latency)),
            Err(e) => Ok(ProbeOutcome::failed(e.to_string())),
        }
    }

    /// Injects an external health observation for a managed instance.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn report_heartbeat(
        &self,
        id: &str,
        healthy: bool,
        latency_ms: Option<f64>,
        error: Option<String>,
    ) -> Result<()> {
        if self.inner.instances.get(id).is_none() {
            return Err(GatewayError::NotFound(format!("instance {id}")));
        }
        let outcome = if healthy {
            ProbeOutcome::ok(latency_ms.unwrap_or(0.0))
        } else {
            ProbeOutcome::failed(error.unwrap_or_else(|| "heartbeat reported unhealthy".into()))
        };
        self.inner.health.report_heartbeat(id, outcome, &self.flip_callback());
        Ok(())
    }

    /// Health snapshot of one instance.
    #[must_use]
    pub fn health_snapshot(&self, id: &str) -> Option<HealthSnapshot> {
        self.inner.health.snapshot(id)
    }

    /// Global health aggregates.
    #[must_use]
    pub fn get_health_aggregates(&self) -> HealthAggregates {
        self.inner.health.aggregates()
    }

    /// Registry-wide counters.
    #[must_use]
    pub fn get_registry_stats(&self) -> RegistryStats {
        let instances = self.list_instances();
        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        for instance in &instances {
            *by_state.entry(instance.state.to_string()).or_default() += 1;
        }
        RegistryStats {
            templates: self.inner.templates.count(),
            instances: instances.len(),
            healthy_instances: self.get_healthy_instances(None).len(),
            by_state,
        }
    }

    // ------------------------------------------------------------------
    // Outcome reporting (router feedback)
    // ------------------------------------------------------------------

    /// Marks a request against an instance as started.
    pub fn begin_request(&self, id: &str) {
        self.inner.balancer.begin_request(id);
    }

    /// Records a successful call against breaker and balancer.
    pub fn record_success(&self, id: &str, latency_ms: f64) {
        self.inner.breakers.breaker(id).record_success();
        self.inner.balancer.report_success(id, latency_ms);
        let _ = self.inner.instances.reset_error_count(id);
    }

    /// Records a failed call against breaker, balancer, and error counter.
    pub fn record_failure(&self, id: &str) {
        self.inner.breakers.breaker(id).record_failure();
        self.inner.balancer.report_failure(id);
        let _ = self.inner.instances.increment_error_count(id);
    }

    /// Balancer metrics snapshot for one instance.
    #[must_use]
    pub fn balancer_snapshot(&self, id: &str) -> Option<crate::balancer::ChannelMetrics> {
        self.inner.balancer.snapshot(id)
    }

    /// Whether the instance's breaker currently refuses requests. This is
    /// the admission check: an open breaker past its sleep window flips to
    /// half-open here.
    #[must_use]
    pub fn breaker_allows(&self, id: &str) -> bool {
        self.inner.breakers.breaker(id).allow_request()
    }

    // ------------------------------------------------------------------
    // Logs & misc
    // ------------------------------------------------------------------

    /// The most recent `limit` log lines of an instance.
    #[must_use]
    pub fn logs(&self, id: &str, limit: usize) -> Vec<LogLine> {
        self.inner.logs.get(id).map_or_else(Vec::new, |ring| {
            let ring = ring.lock().expect("log ring lock poisoned");
            ring.iter().rev().take(limit).rev().cloned().collect()
        })
    }

    fn push_log(&self, id: &str, source: &'static str, line: String) {
        push_log_inner(&self.inner, id, source, line);
    }

    /// Updates the frozen env of an instance; takes effect on next connect.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn patch_instance_env(&self, id: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let mut instance = self
            .inner
            .instances
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        for (key, value) in env {
            instance.config.env.insert(key.clone(), resolve_env_ref(value));
        }
        // Frozen config is owned by the manager; write the merged copy back
        // through its surface.
        self.inner.instances.set_metadata(id, "envPatchedAt", json!(Utc::now().to_rfc3339()))?;
        self.inner.instances.replace_config(id, instance.config)?;
        self.push_log(id, "lifecycle", "environment patched".to_string());
        Ok(())
    }

    /// Event bus handle.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Sandbox policy in effect.
    #[must_use]
    pub fn sandbox(&self) -> &SandboxPolicy {
        &self.inner.sandbox
    }

    /// Stops monitors and disconnects every adapter.
    pub async fn shutdown(&self) {
        self.inner.health.shutdown();
        for entry in &self.inner.forwarders {
            entry.value().abort();
        }
        self.inner.forwarders.clear();
        let ids: Vec<String> =
            self.inner.adapters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, adapter)) = self.inner.adapters.remove(&id) {
                if let Err(e) = adapter.disconnect().await {
                    warn!(instance = %id, error = %e, "adapter teardown failed");
                }
            }
        }
        info!("registry shut down");
    }
}

fn push_log_inner(inner: &RegistryInner, id: &str, source: &'static str, line: String) {
    if let Some(ring) = inner.logs.get(id) {
        let mut ring = ring.lock().expect("log ring lock poisoned");
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(LogLine {
            timestamp: Utc::now(),
            source,
            line,
        });
    }
}
