//! CLI entry points: `serve` and `check-config`.

pub mod args;

pub use args::{Cli, Command};

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::Strategy;
use crate::config::{ConfigPaths, load_gateway_config, load_templates};
use crate::error::Result;
use crate::events::{Event, EventBus, EventKind};
use crate::middleware::{
    AuthMiddleware, Authenticator, BalancerMiddleware, ChainConfig, Middleware, MiddlewareChain,
    RateLimitMiddleware, SecurityGuard,
};
use crate::observability::{init_metrics, metrics};
use crate::registry::ServiceRegistry;
use crate::router::Router;
use crate::transport::sandbox::SandboxPolicy;
use crate::web::{self, AppState};

/// Runs the parsed command to completion.
///
/// # Errors
///
/// Propagates config, bind, and runtime failures.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Serve {
        config: "config".into(),
        host: None,
        port: None,
    }) {
        Command::Serve { config, host, port } => serve(&config, host, port).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

/// Builds the full service plane and serves until interrupted.
async fn serve(config_dir: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let paths = ConfigPaths::new(config_dir);
    let mut config = load_gateway_config(&paths.gateway_file())?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Err(e) = init_metrics(config.metrics_port) {
        warn!(error = %e, "metrics disabled");
    }

    let bus = EventBus::new();
    let sandbox = SandboxPolicy::from_config(&config.sandbox);
    let registry = ServiceRegistry::new(sandbox, bus.clone());

    for template in load_templates(&paths.templates_dir()) {
        let name = template.name.clone();
        match registry.register_template(template) {
            Ok(_) => info!(template = %name, "template loaded"),
            Err(e) => warn!(template = %name, error = %e, "template rejected"),
        }
    }

    let authenticator = Arc::new(Authenticator::new(config.auth.clone()));
    if config.auth.handshake.enabled {
        // Surfaced out of band on purpose: browsers must get it from the
        // operator, never from an endpoint.
        info!(code = %authenticator.handshake().current_code(), "handshake pairing code");
    }

    let default_strategy: Strategy = config.routing.strategy;
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(AuthMiddleware::new(Arc::clone(&authenticator))),
        Arc::new(RateLimitMiddleware::new(config.rate_limit.clone())),
        Arc::new(SecurityGuard::new(
            Vec::new(),
            config.sandbox.allowed_volume_roots.clone(),
        )),
        Arc::new(BalancerMiddleware::new(registry.clone(), default_strategy)),
    ];
    let chain = MiddlewareChain::new(middlewares, ChainConfig::default());

    let router = Arc::new(Router::new(
        registry.clone(),
        default_strategy,
        config.routing.rules.clone(),
    ));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let bind_host = config.host.clone();
    let bind_port = config.port;
    let ceiling = config.request_ceiling;
    let state = AppState {
        registry: registry.clone(),
        router,
        chain,
        authenticator,
        bus: bus.clone(),
        config: Arc::new(RwLock::new(config)),
        paths,
        started: Instant::now(),
        ceiling: Arc::new(Semaphore::new(ceiling)),
        cancel: cancel.clone(),
    };

    let outcome = web::serve(state, &bind_host, bind_port).await;

    // Orderly teardown: subscribers get a terminal close notice, then the
    // bus refuses further publishes.
    bus.publish(Event::new(EventKind::Close, json!({ "reason": "shutdown" })));
    registry.shutdown().await;
    bus.close();
    metrics::set_instances(0);
    info!("gateway stopped");
    outcome
}

/// Cancels the root token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("interrupt received, shutting down"),
            () = terminate => info!("termination requested, shutting down"),
        }
        cancel.cancel();
    });
}

/// Validates a config directory and prints a human summary.
fn check_config(config_dir: &Path) -> Result<()> {
    let paths = ConfigPaths::new(config_dir);
    let config = load_gateway_config(&paths.gateway_file())?;
    println!("gateway config: OK ({}:{})", config.host, config.port);

    let templates = load_templates(&paths.templates_dir());
    println!("templates: {} valid", templates.len());
    for template in &templates {
        println!("  {} ({} transport)", template.name, template.transport);
    }

    let policy = SandboxPolicy::from_config(&config.sandbox);
    for template in &templates {
        let effective = policy.apply_trust(template);
        if effective.transport != template.transport {
            println!(
                "  note: {} would launch as {} transport (trust policy)",
                template.name, effective.transport
            );
        }
    }
    Ok(())
}
