//! apiserve - a generic HTTP API server runtime
//!
//! This crate provides the serving core of an API server:
//! - One-shot lifecycle signals that drive a phased graceful shutdown
//! - Liveness and readiness endpoints, with readiness failing the moment
//!   shutdown begins
//! - Pre-shutdown hooks and a bounded connection drain
//! - Prometheus metrics

pub mod config;
pub mod metrics;
pub mod server;
pub mod util;

pub use config::Config;
pub use server::{GenericServer, PreparedGenericServer, ServerConfig};
