//! Configuration schema for the gateway and its service templates.
//!
//! Everything here is plain serde data: the loader reads it from JSON files,
//! the HTTP surface accepts it on `POST /api/templates` and `PUT /api/config`.
//! Validation is explicit (`validate()`) rather than baked into
//! deserialization so API errors can carry field-level messages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::balancer::Strategy;
use crate::error::{GatewayError, Result};
use crate::router::RoutingRule;
use crate::transport::TransportKind;

/// Protocol version sent during adapter negotiation unless overridden.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Default per-call timeout for a template.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// A reusable recipe for spawning or reaching one backend.
///
/// Immutable once stored in the template registry; replaced wholesale, never
/// patched in place (the `PATCH …/env` endpoint produces a replacement).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    /// Unique template name; doubles as the routing group.
    pub name: String,
    /// Tool-protocol version used in `initialize` negotiation.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// How the backend is reached.
    pub transport: TransportKind,
    /// Executable for stdio/container transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments; `${NAME}` references resolve at instance creation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment overlay; `${NAME}` references resolve at instance creation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory for stdio/container children.
    #[serde(default, rename = "workingDirectory", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Endpoint for http/sse transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra request headers for http/sse transports.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Per-call deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Router-level retry budget for idempotent calls.
    #[serde(default)]
    pub retries: u32,
    /// Health probing overrides; probing uses defaults when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSpec>,
    /// Container launch descriptor (required for container transport).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,
    /// Trust and isolation requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySpec>,
    /// Opt-out of the plaintext-secret guard on `env`.
    #[serde(default)]
    pub allow_plaintext_env: bool,
}

impl ServiceTemplate {
    /// Trust level, defaulting to trusted when no descriptor is present.
    #[must_use]
    pub fn trust(&self) -> TrustLevel {
        self.security.as_ref().map_or(TrustLevel::Trusted, |s| s.trust)
    }

    /// Checks structural invariants.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::Validation("template name must not be empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(GatewayError::Validation(format!(
                "template name {:?} may only contain alphanumerics, '-' and '_'",
                self.name
            )));
        }
        if self.timeout_ms == 0 {
            return Err(GatewayError::Validation("timeoutMs must be positive".into()));
        }

        match self.transport {
            TransportKind::Stdio | TransportKind::Container => {
                if self.command.as_deref().is_none_or(str::is_empty) {
                    return Err(GatewayError::Validation(format!(
                        "{} transport requires a command",
                        self.transport
                    )));
                }
                if self.transport == TransportKind::Container && self.container.is_none() {
                    return Err(GatewayError::Validation(
                        "container transport requires a container descriptor".into(),
                    ));
                }
            }
            TransportKind::Http | TransportKind::Sse => {
                if self.url.as_deref().is_none_or(str::is_empty) {
                    return Err(GatewayError::Validation(format!(
                        "{} transport requires a url",
                        self.transport
                    )));
                }
            }
        }

        if !self.allow_plaintext_env {
            for (key, value) in &self.env {
                if looks_secret(key) && !is_env_ref(value) && !value.is_empty() {
                    return Err(GatewayError::Validation(format!(
                        "env {key} looks like a secret; use a ${{NAME}} reference \
                         or set allowPlaintextEnv"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Health probing overrides for one template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSpec {
    /// Probe period in milliseconds.
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,
    /// Per-probe timeout in milliseconds.
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
    /// Probe method; defaults to a `tools/list` envelope.
    #[serde(default = "default_health_method")]
    pub method: String,
}

const fn default_health_interval() -> u64 {
    30_000
}

const fn default_health_timeout() -> u64 {
    5_000
}

fn default_health_method() -> String {
    "tools/list".to_string()
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            method: default_health_method(),
        }
    }
}

/// One host path mounted into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Host-side path; must resolve under an allowed volume root.
    pub host_path: PathBuf,
    /// In-container path; `..` segments are rejected.
    pub container_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Container launch descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Image reference.
    pub image: String,
    /// Volume mounts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    /// Network policy applied at launch.
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Mount the root filesystem read-only.
    #[serde(default)]
    pub readonly_rootfs: bool,
    /// Memory cap in megabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    /// CPU cap in cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
}

/// Container network policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Use the runtime's default network.
    #[default]
    Inherit,
    /// No network at all.
    Blocked,
    /// Host-local traffic only.
    LocalOnly,
    /// Unrestricted.
    Full,
}

/// How much the gateway trusts a template's code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// First-party or vetted code.
    #[default]
    Trusted,
    /// Known vendor, reduced privileges.
    Partner,
    /// Arbitrary third-party code.
    Untrusted,
}

/// Trust and isolation requirements for one template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Trust tier.
    #[serde(default)]
    pub trust: TrustLevel,
    /// Force container isolation regardless of policy.
    #[serde(default)]
    pub require_container: bool,
    /// Network policy override.
    #[serde(default)]
    pub network: NetworkPolicy,
}

/// Top-level gateway configuration (`config/gateway.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Routing strategy and rules.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Per-principal rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// CORS settings for the HTTP surface.
    #[serde(default)]
    pub cors: CorsConfig,
    /// Sandbox policy for stdio/container launches.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Maximum concurrently handled requests before fail-fast.
    #[serde(default = "default_request_ceiling")]
    pub request_ceiling: usize,
    /// Prometheus listener port; metrics are recorder-only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8484
}

const fn default_request_ceiling() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            routing: RoutingConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            sandbox: SandboxConfig::default(),
            request_ceiling: default_request_ceiling(),
            metrics_port: None,
        }
    }
}

impl GatewayConfig {
    /// Checks structural invariants.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(GatewayError::Validation("host must not be empty".into()));
        }
        if self.request_ceiling == 0 {
            return Err(GatewayError::Validation("requestCeiling must be positive".into()));
        }
        if self.rate_limit.capacity == 0 {
            return Err(GatewayError::Validation("rateLimit.capacity must be positive".into()));
        }
        if self.rate_limit.refill_per_sec <= 0.0 {
            return Err(GatewayError::Validation(
                "rateLimit.refillPerSec must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Authentication mode for the HTTP surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every request is anonymous; for loopback development only.
    Disabled,
    /// Bearer token, API key, or handshake token required.
    #[default]
    Token,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Mode switch.
    #[serde(default)]
    pub mode: AuthMode,
    /// Accepted opaque bearer tokens.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bearer_tokens: Vec<String>,
    /// Accepted API keys mapped to principal names.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_keys: BTreeMap<String, String>,
    /// Browser handshake flow.
    #[serde(default)]
    pub handshake: HandshakeConfig,
}

/// Handshake-token flow settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeConfig {
    /// Whether `Authorization: LocalMCP` tokens are accepted.
    #[serde(default)]
    pub enabled: bool,
    /// Origins allowed to start a handshake; empty means none.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_origins: Vec<String>,
}

/// Routing strategy and rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Default balancing strategy.
    #[serde(default)]
    pub strategy: Strategy,
    /// Ordered rules; higher priority wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RoutingRule>,
}

/// Token-bucket rate limiting per principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Bucket capacity.
    #[serde(default = "default_rl_capacity")]
    pub capacity: u32,
    /// Tokens restored per second, wall-clock based.
    #[serde(default = "default_rl_refill")]
    pub refill_per_sec: f64,
}

const fn default_rl_capacity() -> u32 {
    60
}

const fn default_rl_refill() -> f64 {
    1.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rl_capacity(),
            refill_per_sec: default_rl_refill(),
        }
    }
}

/// CORS settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
    /// Allowed origins; empty disables CORS headers, `"*"` allows any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_origins: Vec<String>,
}

/// Sandbox policy knobs persisted in the gateway config.
///
/// The executable allow-list roots here are *additions*; the effective
/// policy always includes the PATH captured at process start and the
/// runtime install root (see the sandbox module).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Extra executable roots beyond the built-in set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_exec_roots: Vec<PathBuf>,
    /// Roots under which container volume host paths must live.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_volume_roots: Vec<PathBuf>,
    /// Container runtime binary.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Rewrite untrusted stdio templates to container transport.
    #[serde(default)]
    pub require_container_for_untrusted: bool,
    /// Permit shell metacharacters in command arguments.
    #[serde(default)]
    pub allow_shell_metacharacters: bool,
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

/// Whether a value is a `${NAME}` environment reference.
#[must_use]
pub fn is_env_ref(value: &str) -> bool {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .is_some_and(|name| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        })
}

/// Resolves a `${NAME}` reference against the process environment.
///
/// Non-references and unresolvable references are returned unchanged, so a
/// missing variable keeps the literal `${NAME}` text.
#[must_use]
pub fn resolve_env_ref(value: &str) -> String {
    if is_env_ref(value) {
        let name = &value[2..value.len() - 1];
        std::env::var(name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Heuristic for keys whose plaintext values should not sit in config files.
fn looks_secret(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ["TOKEN", "SECRET", "PASSWORD", "PASSWD", "API_KEY", "APIKEY", "PRIVATE_KEY"]
        .iter()
        .any(|m| upper.contains(m))
}
