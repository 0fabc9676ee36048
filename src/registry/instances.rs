//! Instance ownership and the instance state machine.
//!
//! The [`InstanceManager`] is the sole owner of instance state: every
//! mutation funnels through it, and everything it hands out is a clone.
//! State transitions are validated against the state machine below; an id,
//! once minted, is never minted again for the lifetime of the process.
//!
//! ```text
//! idle → starting → running ⇄ degraded
//!            ↘ error
//! any non-terminal → stopping → stopped
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::schema::ServiceTemplate;
use crate::error::{GatewayError, Result};

/// Metadata key holding the instance mode.
pub const META_MODE: &str = "mode";
/// Metadata key holding the latest probe error text.
pub const META_LAST_PROBE_ERROR: &str = "lastProbeError";
/// Metadata key holding the balancer weight.
pub const META_WEIGHT: &str = "weight";
/// Metadata key stamped on every state transition.
pub const META_STATE_CHANGED_AT: &str = "stateChangedAt";

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Created, never used.
    Idle,
    /// Adapter connect in progress.
    Starting,
    /// Connected and serving.
    Running,
    /// Health monitor flagged it; still serving as last resort.
    Degraded,
    /// Teardown in progress.
    Stopping,
    /// Terminal: removed cleanly.
    Stopped,
    /// Terminal: failed to start.
    Error,
}

impl InstanceState {
    /// Whether the state has no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether the machine allows `self → to`.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Self::Idle, Self::Starting)
            | (Self::Starting, Self::Running | Self::Error)
            | (Self::Running, Self::Degraded)
            | (Self::Degraded, Self::Running)
            | (Self::Stopping, Self::Stopped) => true,
            (_, Self::Stopping) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Who owns an instance's lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceMode {
    /// The gateway probes and may restart the instance.
    #[default]
    KeepAlive,
    /// An external system owns it; the gateway only forwards and accepts
    /// heartbeats.
    Managed,
}

/// A running (or pending) realization of a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Opaque id: `{template}-{unix-ms}-{6 hex}`.
    pub id: String,
    /// Name of the template this instance realizes.
    pub template: String,
    /// Frozen copy of the resolved configuration.
    pub config: ServiceTemplate,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Failures recorded against this instance.
    pub error_count: u32,
    /// Mutable key/value annotations (`mode`, `weight`, probe errors, …).
    pub metadata: BTreeMap<String, Value>,
    /// Creation order within this process; listings sort by it so groups
    /// keep registration order even when ids share a millisecond.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl ServiceInstance {
    /// The lifecycle mode stored in metadata.
    #[must_use]
    pub fn mode(&self) -> InstanceMode {
        self.metadata
            .get(META_MODE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Balancer weight (`metadata.weight`, default 1).
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.metadata
            .get(META_WEIGHT)
            .and_then(Value::as_u64)
            .map_or(1, |w| u32::try_from(w).unwrap_or(u32::MAX))
    }
}

/// Sole owner of the `id → instance` map.
#[derive(Default)]
pub struct InstanceManager {
    instances: DashMap<String, ServiceInstance>,
    /// Every id ever minted; ids are never reused even after removal.
    minted: Mutex<HashSet<String>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl InstanceManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an instance in `idle` from a frozen resolved config.
    pub fn create(
        &self,
        template: &str,
        config: ServiceTemplate,
        mode: InstanceMode,
    ) -> ServiceInstance {
        let id = self.mint_id(template);
        let mut metadata = BTreeMap::new();
        metadata.insert(
            META_MODE.to_string(),
            serde_json::to_value(mode).expect("mode serializes"),
        );
        let instance = ServiceInstance {
            id: id.clone(),
            template: template.to_string(),
            config,
            state: InstanceState::Idle,
            started_at: Utc::now(),
            error_count: 0,
            metadata,
            seq: self.next_seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        };
        self.instances.insert(id, instance.clone());
        instance
    }

    /// Mints a process-unique instance id.
    fn mint_id(&self, template: &str) -> String {
        let mut minted = self.minted.lock().expect("minted lock poisoned");
        loop {
            let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..6].to_string();
            let id = format!("{template}-{}-{suffix}", Utc::now().timestamp_millis());
            if minted.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Clone of one instance.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceInstance> {
        self.instances.get(id).map(|i| i.clone())
    }

    /// Clones of all instances, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<_> = self.instances.iter().map(|i| i.clone()).collect();
        all.sort_by_key(|i| i.seq);
        all
    }

    /// Clones of the instances realizing one template.
    #[must_use]
    pub fn list_by_template(&self, template: &str) -> Vec<ServiceInstance> {
        let mut matching: Vec<_> = self
            .instances
            .iter()
            .filter(|i| i.template == template)
            .map(|i| i.clone())
            .collect();
        matching.sort_by_key(|i| i.seq);
        matching
    }

    /// Applies a validated state transition, stamping the change time.
    ///
    /// Returns the previous state.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Validation` for transitions outside the
    /// state machine (including anything out of a terminal state).
    pub fn update_state(&self, id: &str, to: InstanceState) -> Result<InstanceState> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        let from = entry.state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition(to) {
            return Err(GatewayError::Validation(format!(
                "instance {id}: illegal transition {from} → {to}"
            )));
        }
        entry.state = to;
        entry.metadata.insert(
            META_STATE_CHANGED_AT.to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        Ok(from)
    }

    /// Removes an instance outright, returning its final snapshot.
    pub fn remove(&self, id: &str) -> Option<ServiceInstance> {
        self.instances.remove(id).map(|(_, instance)| instance)
    }

    /// Sets one metadata key.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn set_metadata(&self, id: &str, key: &str, value: Value) -> Result<()> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        entry.metadata.insert(key.to_string(), value);
        Ok(())
    }

    /// Replaces an instance's frozen config (env patches apply on the next
    /// connect).
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn replace_config(&self, id: &str, config: ServiceTemplate) -> Result<()> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        entry.config = config;
        Ok(())
    }

    /// Bumps the error counter, returning the new value.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn increment_error_count(&self, id: &str) -> Result<u32> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        entry.error_count = entry.error_count.saturating_add(1);
        Ok(entry.error_count)
    }

    /// Clears the error counter.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn reset_error_count(&self, id: &str) -> Result<()> {
        let mut entry = self
            .instances
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {id}")))?;
        entry.error_count = 0;
        Ok(())
    }

    /// Number of live instances.
    #[must_use]
    pub fn count(&self) -> usize {
        self.instances.len()
    }
}
