//! Restart policy enforcement.
//!
//! The enforcer watches health transitions and asks the process supervisor
//! to restart the service when it becomes unhealthy. Operator intent lives
//! in an explicit [`StopFlag`] handed in by the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dinox_core::{HealthState, RestartPolicy};

use crate::error::{SupervisorError, SupervisorResult};

/// Set when an operator deliberately stopped the service.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Instruction for the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    Restart { reason: String },
    Stop,
    Start,
}

/// What the enforcer decided for one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// A restart was requested.
    Restart,
    /// The transition was not an entry into `unhealthy`.
    NoTransition,
    /// The restart policy does not restart on health failure.
    PolicyDeclined,
    /// The operator stopped the service; it stays down.
    OperatorStopped,
}

/// Turns entries into `unhealthy` into restart requests.
#[derive(Debug, Clone)]
pub struct RestartEnforcer {
    policy: RestartPolicy,
    stop: StopFlag,
    commands: mpsc::Sender<SupervisorCommand>,
}

impl RestartEnforcer {
    pub fn new(policy: RestartPolicy, stop: StopFlag, commands: mpsc::Sender<SupervisorCommand>) -> Self {
        Self { policy, stop, commands }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Decide without side effects.
    pub fn decide(&self, from: HealthState, to: HealthState) -> RestartDecision {
        if to != HealthState::Unhealthy || from == HealthState::Unhealthy {
            return RestartDecision::NoTransition;
        }
        if self.stop.is_set() {
            return RestartDecision::OperatorStopped;
        }
        if !self.policy.restarts_on_unhealthy() {
            return RestartDecision::PolicyDeclined;
        }
        RestartDecision::Restart
    }

    /// Decide and, if warranted, send a restart request.
    pub async fn observe(&self, from: HealthState, to: HealthState) -> SupervisorResult<RestartDecision> {
        let decision = self.decide(from, to);
        match decision {
            RestartDecision::Restart => {
                info!(policy = %self.policy, "requesting restart of unhealthy service");
                self.commands
                    .send(SupervisorCommand::Restart {
                        reason: format!("health check transitioned {from} -> {to}"),
                    })
                    .await
                    .map_err(|_| SupervisorError::CommandChannelClosed)?;
            }
            RestartDecision::OperatorStopped => {
                info!("service unhealthy but stopped by operator; not restarting");
            }
            RestartDecision::PolicyDeclined => {
                warn!(policy = %self.policy, "service unhealthy; restart policy does not restart it");
            }
            RestartDecision::NoTransition => {
                debug!(%from, %to, "no restart action");
            }
        }
        Ok(decision)
    }
}
