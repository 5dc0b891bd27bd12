//! dinox-health — health checking and restart enforcement for dinox.
//!
//! Provides the HTTP prober, the consecutive-failure state tracker, and the
//! restart policy enforcer, tied together by a background monitor loop.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor (one background task)
//!   ├── interval tick (fixed cadence, one probe in flight)
//!   ├── Probe::probe() → ProbeResult
//!   ├── HealthTracker (starting → healthy ⇄ unhealthy)
//!   ├── RestartEnforcer → SupervisorCommand::Restart
//!   └── watch::Sender<HealthSnapshot> for status queries
//! ```
//!
//! The service is marked unhealthy after `retries` consecutive failures.
//! A single successful probe resets the counter and restores `healthy`.

pub mod checker;
pub mod error;
pub mod monitor;
pub mod restart;

pub use checker::{HealthTracker, HttpProber, Probe, ProbeResult, http_probe};
pub use error::{SupervisorError, SupervisorResult};
pub use monitor::{HealthMonitor, HealthSnapshot, MonitorHandle};
pub use restart::{RestartDecision, RestartEnforcer, StopFlag, SupervisorCommand};
