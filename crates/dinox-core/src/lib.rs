//! dinox-core — service definition and shared types for the dinox supervisor.
//!
//! A service is described by a `dinox.toml` file: how to run it, what it
//! publishes and mounts, its restart policy, and the HTTP health check that
//! decides whether it is alive.

pub mod config;
pub mod error;
pub mod types;

pub use config::{HealthCheckConfig, HealthCheckSpec, ProbeTarget, ServiceConfig, ServiceSection};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
