//! Shared types used across dinox crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Health of the supervised service as seen by the probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No successful probe yet and the failure threshold not reached.
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule deciding whether the service is brought back after it goes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    No,
    /// Restart on any exit or health failure.
    Always,
    /// Restart only when the process exits with a non-zero code.
    OnFailure,
    /// Like `always`, except after an explicit operator stop.
    #[default]
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }

    /// Whether entering `unhealthy` should trigger a restart.
    pub fn restarts_on_unhealthy(&self) -> bool {
        matches!(self, RestartPolicy::Always | RestartPolicy::UnlessStopped)
    }

    /// Whether a process exit with `exit_code` should trigger a restart.
    ///
    /// `None` means the process was killed by a signal.
    pub fn restarts_on_exit(&self, exit_code: Option<i32>) -> bool {
        match self {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure => exit_code != Some(0),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestartPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no" => Ok(RestartPolicy::No),
            "always" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            other => Err(ConfigError::UnknownRestartPolicy(other.to_string())),
        }
    }
}

/// A published port, written as `HOST:CONTAINER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl FromStr for PortMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPort(s.to_string());
        let (host, container) = s.trim().split_once(':').ok_or_else(invalid)?;
        Ok(PortMapping {
            host: host.parse().map_err(|_| invalid())?,
            container: container.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// A file or directory injected into the service, written as
/// `HOST:CONTAINER[:ro|rw]`. The contents are opaque to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl FromStr for VolumeMount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVolume(s.to_string());
        let mut parts = s.trim().split(':');
        let host = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let container = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(_) => return Err(invalid()),
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(VolumeMount {
            host: host.to_string(),
            container: container.to_string(),
            read_only,
        })
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)?;
        if self.read_only {
            f.write_str(":ro")?;
        }
        Ok(())
    }
}
