//! Health monitor — background task that probes the service on a fixed
//! cadence, tracks its health, and enforces the restart policy.
//!
//! Exactly one probe is in flight at a time. Cancelling the monitor drops
//! any in-flight probe; its result never reaches the tracker.

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use dinox_core::{HealthCheckSpec, HealthState};

use crate::checker::{HealthTracker, Probe, ProbeResult};
use crate::error::SupervisorResult;
use crate::restart::{RestartDecision, RestartEnforcer};

/// Read-only view of the service's health, published after every probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_probe: Option<ProbeResult>,
    pub restarts_requested: u32,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            state: HealthState::Starting,
            consecutive_failures: 0,
            last_probe: None,
            restarts_requested: 0,
        }
    }
}

/// Probe loop for a single service.
pub struct HealthMonitor<P: Probe> {
    spec: HealthCheckSpec,
    prober: P,
    enforcer: RestartEnforcer,
    status_tx: watch::Sender<HealthSnapshot>,
}

impl<P: Probe> HealthMonitor<P> {
    pub fn new(spec: HealthCheckSpec, prober: P, enforcer: RestartEnforcer) -> Self {
        let (status_tx, _) = watch::channel(HealthSnapshot::default());
        Self {
            spec,
            prober,
            enforcer,
            status_tx,
        }
    }

    /// Subscribe to snapshot updates.
    pub fn status(&self) -> watch::Receiver<HealthSnapshot> {
        self.status_tx.subscribe()
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tracker = HealthTracker::new(&self.spec);
        let mut restarts_requested = 0u32;

        // First tick completes immediately: the service is probed at t=0.
        let mut ticker = tokio::time::interval(self.spec.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            url = %self.spec.url(),
            interval_ms = self.spec.interval.as_millis() as u64,
            timeout_ms = self.spec.timeout.as_millis() as u64,
            retries = self.spec.retries,
            "health monitor started"
        );

        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("in-flight probe abandoned on shutdown");
                    break;
                }
                result = self.prober.probe() => result,
            };

            let prev = tracker.state();
            let next = tracker.record(&result);

            match self.enforcer.observe(prev, next).await {
                Ok(RestartDecision::Restart) => restarts_requested += 1,
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to deliver restart request"),
            }

            self.status_tx.send_replace(HealthSnapshot {
                state: next,
                consecutive_failures: tracker.consecutive_failures(),
                last_probe: Some(result),
                restarts_requested,
            });
        }

        info!("health monitor stopped");
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = self.status();
        let handle = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle {
            handle,
            shutdown_tx,
            status,
        }
    }
}

/// Handle to a spawned [`HealthMonitor`].
pub struct MonitorHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    status: watch::Receiver<HealthSnapshot>,
}

impl MonitorHandle {
    pub fn status(&self) -> watch::Receiver<HealthSnapshot> {
        self.status.clone()
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        self.status.borrow().clone()
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn shutdown(self) -> SupervisorResult<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle.await?;
        Ok(())
    }
}
