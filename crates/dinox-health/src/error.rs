//! Supervisor error types.

use thiserror::Error;

/// Errors raised by the health supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process supervisor is not accepting commands")]
    CommandChannelClosed,

    #[error("health monitor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
