//! Gateway and template configuration: serde schema plus JSON persistence.

pub mod loader;
pub mod schema;

pub use loader::{
    ConfigPaths, delete_template, load_gateway_config, load_templates, save_gateway_config,
    save_template,
};
pub use schema::{
    AuthConfig, AuthMode, ContainerSpec, CorsConfig, DEFAULT_PROTOCOL_VERSION, DEFAULT_TIMEOUT_MS,
    GatewayConfig, HandshakeConfig, HealthSpec, NetworkPolicy, RateLimitConfig, RoutingConfig,
    SandboxConfig, SecuritySpec, ServiceTemplate, TrustLevel, VolumeMount, is_env_ref,
    resolve_env_ref,
};
