//! Request routing.
//!
//! `route` turns "invoke method M on group G" into a chosen instance: the
//! rule set (ordered by priority, higher first) may rewrite the group, pin
//! an instance, exclude instances, or override the strategy; the balancer
//! picks from whatever survives. `proxy` then speaks to the chosen instance
//! through its adapter, reporting every outcome back to the breaker and
//! balancer, with a retry budget for idempotent methods only.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::balancer::Strategy;
use crate::error::{GatewayError, Result};
use crate::events::{Event, EventKind};
use crate::observability::metrics;
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::transport::{JsonRpcRequest, JsonRpcResponse};

/// Bound of the request-history ring.
const HISTORY_CAPACITY: usize = 256;

/// Methods the retry policy treats as idempotent.
const IDEMPOTENT_METHODS: &[&str] = &[
    "initialize",
    "ping",
    "tools/list",
    "resources/list",
    "resources/read",
    "prompts/list",
    "prompts/get",
];

/// A routing request as the HTTP surface hands it over.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    /// Tool-protocol method to invoke.
    pub method: String,
    /// Parameters, relayed opaquely.
    #[serde(default)]
    pub params: Option<Value>,
    /// Target group (template name); rules may supply or rewrite it.
    #[serde(default)]
    pub service_group: Option<String>,
    /// Caller deadline; the effective deadline is min(this, template's).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Predicate of one routing rule; empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    /// Matches when the request method starts with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_prefix: Option<String>,
    /// Matches when the request group equals this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_group: Option<String>,
}

impl RuleMatch {
    fn matches(&self, method: &str, group: Option<&str>) -> bool {
        if let Some(prefix) = &self.method_prefix {
            if !method.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(expected) = &self.service_group {
            if group != Some(expected.as_str()) {
                return false;
            }
        }
        true
    }
}

/// What a matching rule does to the candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    /// Route to exactly this instance.
    Pin {
        /// Instance id to pin.
        instance: String,
    },
    /// Drop these instances from the candidate set.
    Exclude {
        /// Instance ids to exclude.
        instances: Vec<String>,
    },
    /// Override the balancing strategy.
    Strategy {
        /// Strategy to apply.
        strategy: Strategy,
    },
    /// Replace the target group.
    RewriteGroup {
        /// New group name.
        group: String,
    },
}

/// One ordered routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    /// Rule name, surfaced in decisions.
    pub name: String,
    /// Higher priority evaluates first.
    #[serde(default)]
    pub priority: i32,
    /// Predicate.
    #[serde(default, rename = "match")]
    pub when: RuleMatch,
    /// Effect.
    pub action: RuleAction,
}

/// The structured outcome of a selection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    /// Group the selection ran against.
    pub group: String,
    /// Strategy that made the pick.
    pub strategy: Strategy,
    /// Names of rules that shaped the candidate set.
    pub filters_applied: Vec<String>,
    /// Human-readable summary.
    pub reason: String,
}

/// One entry of the bounded request-history ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// When the route was attempted.
    pub timestamp: DateTime<Utc>,
    /// Requested method.
    pub method: String,
    /// Group after rule application.
    pub group: Option<String>,
    /// Chosen instance, when selection succeeded.
    pub selected: Option<String>,
    /// Whether selection succeeded.
    pub ok: bool,
}

/// Aggregate router metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStats {
    /// Total route attempts.
    pub total: u64,
    /// Successful selections.
    pub succeeded: u64,
    /// succeeded / total.
    pub success_rate: f64,
    /// Selections per strategy.
    pub per_strategy: BTreeMap<String, u64>,
}

/// Turns requests into chosen instances and relays envelopes to them.
pub struct Router {
    registry: ServiceRegistry,
    default_strategy: Strategy,
    rules: RwLock<Vec<RoutingRule>>,
    history: Mutex<VecDeque<HistoryEntry>>,
    total: AtomicU64,
    succeeded: AtomicU64,
    per_strategy: DashMap<&'static str, u64>,
}

impl Router {
    /// Creates a router over a registry.
    #[must_use]
    pub fn new(registry: ServiceRegistry, default_strategy: Strategy, rules: Vec<RoutingRule>) -> Self {
        let router = Self {
            registry,
            default_strategy,
            rules: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            per_strategy: DashMap::new(),
        };
        router.set_rules(rules);
        router
    }

    /// Replaces the rule set, keeping it sorted by priority (higher first).
    pub fn set_rules(&self, mut rules: Vec<RoutingRule>) {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        *self.rules.write().expect("rules lock poisoned") = rules;
    }

    /// Resolves a request to an instance plus the decision that picked it.
    ///
    /// # Errors
    ///
    /// `Validation` when no group can be determined, `NoServiceAvailable`
    /// when the candidate set ends up empty or the pinned instance is gone.
    pub fn route(&self, request: &RouteRequest) -> Result<(ServiceInstance, RoutingDecision)> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let outcome = self.route_inner(request);

        let (group, selected, ok) = match &outcome {
            Ok((instance, decision)) => (Some(decision.group.clone()), Some(instance.id.clone()), true),
            Err(_) => (request.service_group.clone(), None, false),
        };
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
        self.push_history(HistoryEntry {
            timestamp: Utc::now(),
            method: request.method.clone(),
            group,
            selected,
            ok,
        });
        if let Ok((_, decision)) = &outcome {
            *self.per_strategy.entry(decision.strategy.as_str()).or_insert(0) += 1;
            metrics::record_route(decision.strategy.as_str(), true);
        } else {
            metrics::record_route("none", false);
        }
        outcome
    }

    fn route_inner(&self, request: &RouteRequest) -> Result<(ServiceInstance, RoutingDecision)> {
        let mut group = request.service_group.clone();
        let mut strategy = self.default_strategy;
        let mut pinned: Option<String> = None;
        let mut excluded: Vec<String> = Vec::new();
        let mut filters_applied: Vec<String> = Vec::new();

        {
            let rules = self.rules.read().expect("rules lock poisoned");
            for rule in rules.iter() {
                if !rule.when.matches(&request.method, group.as_deref()) {
                    continue;
                }
                filters_applied.push(rule.name.clone());
                match &rule.action {
                    RuleAction::Pin { instance } => pinned = Some(instance.clone()),
                    RuleAction::Exclude { instances } => excluded.extend(instances.iter().cloned()),
                    RuleAction::Strategy { strategy: s } => strategy = *s,
                    RuleAction::RewriteGroup { group: g } => group = Some(g.clone()),
                }
            }
        }

        let group = group.ok_or_else(|| {
            GatewayError::Validation("serviceGroup is required and no rule supplied one".into())
        })?;

        if let Some(pin) = pinned {
            let instance = self.registry.get_instance(&pin).ok_or_else(|| {
                GatewayError::NoServiceAvailable { group: group.clone() }
            })?;
            let decision = RoutingDecision {
                group,
                strategy,
                filters_applied,
                reason: format!("pinned to {pin} by rule"),
            };
            return Ok((instance, decision));
        }

        let candidates: Vec<_> = self
            .registry
            .candidates(&group)
            .into_iter()
            .filter(|c| !excluded.contains(&c.id))
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::NoServiceAvailable { group });
        }

        let chosen = self
            .registry
            .select(&group, strategy, &candidates)
            .ok_or_else(|| GatewayError::NoServiceAvailable { group: group.clone() })?;
        let instance = self
            .registry
            .get_instance(&chosen)
            .ok_or_else(|| GatewayError::NoServiceAvailable { group: group.clone() })?;

        let reason = format!(
            "{} of {} candidate(s) via {strategy}",
            chosen,
            candidates.len()
        );
        let decision = RoutingDecision {
            group,
            strategy,
            filters_applied,
            reason,
        };
        debug!(method = %request.method, instance = %decision.reason, "routed");
        Ok((instance, decision))
    }

    /// Relays one envelope to an instance and returns the peer's reply
    /// verbatim, recording the outcome with breaker and balancer.
    ///
    /// Idempotent methods get a retry budget of `template.retries` with
    /// exponential backoff capped at 10 s; an open breaker short-circuits
    /// retries to `NoServiceAvailable`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `BreakerOpen`, `Timeout`, `Canceled`, or transport
    /// errors wrapped with the routing context.
    pub async fn proxy(
        &self,
        instance_id: &str,
        envelope: JsonRpcRequest,
        timeout_ms: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let instance = self
            .registry
            .get_instance(instance_id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {instance_id}")))?;

        let deadline = Duration::from_millis(
            timeout_ms.map_or(instance.config.timeout_ms, |t| t.min(instance.config.timeout_ms)),
        );
        let budget = if IDEMPOTENT_METHODS.contains(&envelope.method.as_str()) {
            instance.config.retries
        } else {
            0
        };

        let mut attempt: u32 = 0;
        loop {
            match self.proxy_once(&instance, envelope.clone(), deadline, cancel).await {
                Ok(reply) => return Ok(reply),
                Err(GatewayError::BreakerOpen { .. }) if attempt > 0 => {
                    // A breaker that opened mid-retry means the backend is
                    // gone for now; surface it as unavailability.
                    return Err(GatewayError::NoServiceAvailable {
                        group: instance.template.clone(),
                    });
                }
                Err(e) if attempt < budget && e.recoverable() => {
                    attempt += 1;
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(16)))
                        .min(Duration::from_secs(10));
                    warn!(instance = instance_id, error = %e, attempt, "retrying idempotent call");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(GatewayError::Canceled),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn proxy_once(
        &self,
        instance: &ServiceInstance,
        envelope: JsonRpcRequest,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        if !self.registry.breaker_allows(&instance.id) {
            return Err(GatewayError::BreakerOpen {
                instance: instance.id.clone(),
            });
        }

        self.registry.begin_request(&instance.id);
        let started = Instant::now();

        // The deadline covers the whole attempt: a first-use connect (with
        // its negotiation) eats into the same budget as the exchange.
        let attempt = async {
            let adapter = self.registry.adapter(&instance.id).await?;
            self.registry.bus().publish(Event::new(
                EventKind::Sent,
                json!({
                    "serviceId": instance.id,
                    "method": envelope.method,
                    "requestId": envelope.id,
                }),
            ));
            adapter.send_and_receive(envelope, deadline, cancel).await
        };
        let outcome = tokio::time::timeout(deadline, attempt).await.unwrap_or_else(|_| {
            Err(GatewayError::Timeout {
                elapsed_ms: deadline.as_millis() as u64,
            })
        });
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(reply) => {
                // A reply with an error member is still a served request for
                // the breaker: the backend answered. It is relayed verbatim.
                self.registry.record_success(&instance.id, elapsed_ms);
                self.registry.bus().publish(Event::new(
                    EventKind::Message,
                    json!({
                        "serviceId": instance.id,
                        "requestId": reply.id,
                        "ok": reply.error.is_none(),
                    }),
                ));
                Ok(reply)
            }
            Err(e) => {
                self.registry.record_failure(&instance.id);
                Err(e)
            }
        }
    }

    /// Route, then relay the request envelope to the chosen instance.
    ///
    /// # Errors
    ///
    /// Selection errors carry the routing context; proxy errors propagate.
    pub async fn dispatch(
        &self,
        request: &RouteRequest,
        envelope: JsonRpcRequest,
        cancel: &CancellationToken,
    ) -> Result<(ServiceInstance, RoutingDecision, JsonRpcResponse)> {
        let (instance, decision) = self.route(request)?;
        let reply = self
            .proxy(&instance.id, envelope, request.timeout_ms, cancel)
            .await
            .map_err(|e| GatewayError::Routing {
                group: decision.group.clone(),
                strategy: decision.strategy.as_str().to_string(),
                source: Box::new(e),
            })?;
        Ok((instance, decision, reply))
    }

    /// The most recent history entries, newest last.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        let history = self.history.lock().expect("history lock poisoned");
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Aggregate metrics snapshot.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let total = self.total.load(Ordering::Relaxed);
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        RouterStats {
            total,
            succeeded,
            success_rate: if total == 0 {
                1.0
            } else {
                succeeded as f64 / total as f64
            },
            per_strategy: self
                .per_strategy
                .iter()
                .map(|e| ((*e.key()).to_string(), *e.value()))
                .collect(),
        }
    }

    fn push_history(&self, entry: HistoryEntry) {
        let mut history = self.history.lock().expect("history lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{SandboxConfig, ServiceTemplate};
    use crate::events::EventBus;
    use crate::registry::{InstanceMode, InstanceOverrides};
    use crate::transport::sandbox::SandboxPolicy;

    fn registry_with_group(name: &str, instances: usize) -> (ServiceRegistry, Vec<String>) {
        let registry = ServiceRegistry::new(
            SandboxPolicy::from_config(&SandboxConfig::default()),
            EventBus::new(),
        );
        let template: ServiceTemplate = serde_json::from_value(json!({
            "name": name,
            "transport": "stdio",
            "command": "cat",
            "timeoutMs": 1000,
        }))
        .unwrap();
        registry.register_template(template).unwrap();
        let ids = (0..instances)
            .map(|_| {
                registry
                    .create_instance(name, &InstanceOverrides::default(), InstanceMode::Managed)
                    .unwrap()
                    .id
            })
            .collect();
        (registry, ids)
    }

    fn request(group: &str) -> RouteRequest {
        RouteRequest {
            method: "tools/call".into(),
            params: None,
            service_group: Some(group.into()),
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn routes_round_robin_in_creation_order() {
        let (registry, ids) = registry_with_group("g", 3);
        let router = Router::new(registry, Strategy::RoundRobin, vec![]);
        let picks: Vec<String> = (0..6)
            .map(|_| router.route(&request("g")).unwrap().0.id)
            .collect();
        assert_eq!(picks[..3], ids[..]);
        assert_eq!(picks[3..], ids[..]);
    }

    #[tokio::test]
    async fn missing_group_is_validation() {
        let (registry, _) = registry_with_group("g", 1);
        let router = Router::new(registry, Strategy::RoundRobin, vec![]);
        let mut req = request("g");
        req.service_group = None;
        assert_eq!(router.route(&req).unwrap_err().code(), "validation");
    }

    #[tokio::test]
    async fn empty_group_is_no_service() {
        let (registry, _) = registry_with_group("g", 1);
        let router = Router::new(registry, Strategy::RoundRobin, vec![]);
        let err = router.route(&request("empty")).unwrap_err();
        assert_eq!(err.code(), "no_service_available");
    }

    #[tokio::test]
    async fn rewrite_rule_supplies_group() {
        let (registry, _) = registry_with_group("g", 1);
        let rules = vec![RoutingRule {
            name: "tools-to-g".into(),
            priority: 10,
            when: RuleMatch {
                method_prefix: Some("tools/".into()),
                service_group: None,
            },
            action: RuleAction::RewriteGroup { group: "g".into() },
        }];
        let router = Router::new(registry, Strategy::RoundRobin, rules);
        let mut req = request("g");
        req.service_group = None;
        let (_, decision) = router.route(&req).unwrap();
        assert_eq!(decision.group, "g");
        assert_eq!(decision.filters_applied, ["tools-to-g"]);
    }

    #[tokio::test]
    async fn pin_rule_wins() {
        let (registry, ids) = registry_with_group("g", 3);
        let rules = vec![RoutingRule {
            name: "pin".into(),
            priority: 5,
            when: RuleMatch::default(),
            action: RuleAction::Pin {
                instance: ids[2].clone(),
            },
        }];
        let router = Router::new(registry, Strategy::RoundRobin, rules);
        for _ in 0..3 {
            assert_eq!(router.route(&request("g")).unwrap().0.id, ids[2]);
        }
    }

    #[tokio::test]
    async fn exclude_rule_filters() {
        let (registry, ids) = registry_with_group("g", 2);
        let rules = vec![RoutingRule {
            name: "drop-first".into(),
            priority: 1,
            when: RuleMatch::default(),
            action: RuleAction::Exclude {
                instances: vec![ids[0].clone()],
            },
        }];
        let router = Router::new(registry, Strategy::RoundRobin, rules);
        for _ in 0..3 {
            assert_eq!(router.route(&request("g")).unwrap().0.id, ids[1]);
        }
    }

    #[tokio::test]
    async fn priority_orders_rules() {
        let (registry, _) = registry_with_group("g", 1);
        let rules = vec![
            RoutingRule {
                name: "low".into(),
                priority: 1,
                when: RuleMatch::default(),
                action: RuleAction::Strategy {
                    strategy: Strategy::Failover,
                },
            },
            RoutingRule {
                name: "high".into(),
                priority: 100,
                when: RuleMatch::default(),
                action: RuleAction::Strategy {
                    strategy: Strategy::LeastConn,
                },
            },
        ];
        let router = Router::new(registry, Strategy::RoundRobin, rules);
        let (_, decision) = router.route(&request("g")).unwrap();
        // Low priority ran last, so its strategy stands; what matters is
        // that evaluation order followed priority.
        assert_eq!(decision.filters_applied, ["high", "low"]);
        assert_eq!(decision.strategy, Strategy::Failover);
    }

    #[tokio::test]
    async fn history_and_stats_accumulate() {
        let (registry, _) = registry_with_group("g", 1);
        let router = Router::new(registry, Strategy::RoundRobin, vec![]);
        router.route(&request("g")).unwrap();
        router.route(&request("missing")).unwrap_err();

        let stats = router.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.succeeded, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.per_strategy.get("round-robin"), Some(&1));

        let history = router.history(10);
        assert_eq!(history.len(), 2);
        assert!(history[0].ok);
        assert!(!history[1].ok);
    }

    #[tokio::test]
    async fn dispatch_wraps_proxy_failures_with_routing_context() {
        // `cat` echoes requests back as requests, so negotiation never
        // completes and the template deadline turns into a Timeout.
        let (registry, _) = registry_with_group("g", 1);
        let router = Router::new(registry, Strategy::RoundRobin, vec![]);
        let err = router
            .dispatch(
                &request("g"),
                JsonRpcRequest::new("tools/call", None, json!(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        match err {
            GatewayError::Routing { group, strategy, .. } => {
                assert_eq!(group, "g");
                assert_eq!(strategy, "round-robin");
            }
            other => panic!("expected routing wrap, got {other}"),
        }
    }

    #[tokio::test]
    async fn proxy_unknown_instance_is_not_found() {
        let (registry, _) = registry_with_group("g", 1);
        let router = Router::new(registry, Strategy::RoundRobin, vec![]);
        let err = router
            .proxy(
                "ghost",
                JsonRpcRequest::new("tools/list", None, json!(1)),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
