//! toolgate — authenticated gateway and load balancer for JSON-RPC tool
//! servers.
//!
//! The service plane: a template registry and instance manager own the
//! backend fleet, transport adapters speak the tool protocol over stdio,
//! HTTP, SSE, or a container runtime, a health monitor keeps liveness
//! facts, and the router picks healthy instances through a circuit breaker
//! and load balancer. An axum HTTP surface with a middleware chain
//! (authentication, rate limiting, security guard) fronts the whole thing
//! and fans lifecycle events out to SSE subscribers.

pub mod balancer;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod middleware;
pub mod observability;
pub mod registry;
pub mod router;
pub mod transport;
pub mod web;

pub use error::{GatewayError, Result};
