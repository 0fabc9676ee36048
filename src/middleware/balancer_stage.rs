//! Load-balancer middleware.
//!
//! Bridges the chain to the registry's balancer: before the tool stage it
//! makes sure an instance is selected (writing the id into the state for
//! downstream middlewares), and after the tool stage it feeds the recorded
//! outcome back into the per-instance counters. Flows that go through the
//! router's own proxy path leave no outcome in the state, so nothing is
//! double-counted.

use serde_json::json;

use super::{ChainState, Middleware, VAL_GROUP, VAL_INSTANCE, VAL_OUTCOME};
use crate::balancer::Strategy;
use crate::error::Result;
use crate::registry::ServiceRegistry;

/// Chain stage exposing balancer selection and outcome reporting.
pub struct BalancerMiddleware {
    registry: ServiceRegistry,
    strategy: Strategy,
}

impl BalancerMiddleware {
    /// Creates the middleware with the router's default strategy.
    #[must_use]
    pub fn new(registry: ServiceRegistry, strategy: Strategy) -> Self {
        Self { registry, strategy }
    }
}

#[async_trait::async_trait]
impl Middleware for BalancerMiddleware {
    fn name(&self) -> &str {
        "load-balancer"
    }

    async fn before_tool(&self, state: &mut ChainState) -> Result<()> {
        if state.values.contains_key(VAL_INSTANCE) {
            return Ok(());
        }
        let Some(group) = state.get_str(VAL_GROUP).map(str::to_string) else {
            return Ok(());
        };
        // Selection failures are not this middleware's to raise; the tool
        // stage reports NoServiceAvailable with full routing context.
        if let Ok(instance) = self.registry.select_best_instance(&group, self.strategy) {
            state.set(VAL_INSTANCE, json!(instance.id));
        }
        Ok(())
    }

    async fn after_tool(&self, state: &mut ChainState) -> Result<()> {
        let Some(outcome) = state.values.get(VAL_OUTCOME) else {
            return Ok(());
        };
        let Some(instance) = outcome.get("instanceId").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let ok = outcome.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false);
        let latency_ms = outcome
            .get("latencyMs")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);

        self.registry.begin_request(instance);
        if ok {
            self.registry.record_success(instance, latency_ms);
        } else {
            self.registry.record_failure(instance);
        }
        Ok(())
    }
}
