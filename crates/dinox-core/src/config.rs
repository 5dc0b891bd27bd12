//! dinox.toml service definition parser.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{PortMapping, RestartPolicy, VolumeMount};

pub const DEFAULT_HEALTH_URL: &str = "http://localhost:8501/_stcore/health";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRIES: u32 = 3;
/// Longest accepted interval, timeout or start period.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service: ServiceSection,
    pub healthcheck: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    pub name: String,
    /// Build context; also the working directory of `command`.
    pub build: Option<String>,
    /// Argv of the supervised process. Absent when the service is run by
    /// something else and only probed here.
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub url: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
}

/// Validated health check settings. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub target: ProbeTarget,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

/// Where a probe connects and what it asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProbeTarget {
    /// `host:port`, used for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The URL requested on every probe.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.authority(), self.path)
    }

    /// Parse an `http://` URL into a probe target.
    pub fn parse(url: &str) -> ConfigResult<Self> {
        let invalid = |reason: &str| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => return Err(invalid(&format!("unsupported scheme `{other}`"))),
            None => return Err(invalid("missing scheme")),
        }
        let host = uri.host().filter(|h| !h.is_empty()).ok_or_else(|| invalid("missing host"))?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");

        Ok(ProbeTarget {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or(80),
            path: path.to_string(),
        })
    }
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        HealthCheckSpec {
            target: ProbeTarget {
                host: "localhost".to_string(),
                port: 8501,
                path: "/_stcore/health".to_string(),
            },
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            start_period: Duration::ZERO,
        }
    }
}

impl HealthCheckSpec {
    pub fn url(&self) -> String {
        self.target.url()
    }
}

impl HealthCheckConfig {
    /// Resolve into a validated spec, filling unset fields with defaults.
    pub fn resolve(&self) -> ConfigResult<HealthCheckSpec> {
        let url = self.url.clone().unwrap_or_else(|| DEFAULT_HEALTH_URL.to_string());
        let target = ProbeTarget::parse(&url)?;
        let interval = duration_field("interval", self.interval.as_deref(), DEFAULT_INTERVAL)?;
        let timeout = duration_field("timeout", self.timeout.as_deref(), DEFAULT_TIMEOUT)?;
        let start_period = duration_field("start_period", self.start_period.as_deref(), Duration::ZERO)?;
        let retries = self.retries.unwrap_or(DEFAULT_RETRIES);

        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if retries == 0 {
            return Err(ConfigError::Invalid {
                field: "retries",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(HealthCheckSpec {
            target,
            interval,
            timeout,
            retries,
            start_period,
        })
    }
}

impl ServiceConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolved health check; defaults apply when the section is absent.
    pub fn health_check(&self) -> ConfigResult<HealthCheckSpec> {
        self.healthcheck.clone().unwrap_or_default().resolve()
    }

    pub fn ports(&self) -> ConfigResult<Vec<PortMapping>> {
        self.service.ports.iter().map(|p| p.parse()).collect()
    }

    pub fn volumes(&self) -> ConfigResult<Vec<VolumeMount>> {
        self.service.volumes.iter().map(|v| v.parse()).collect()
    }

    /// Check every field that has a parsed form.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "service.name",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(command) = &self.service.command {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "service.command",
                    reason: "must name a program".to_string(),
                });
            }
        }
        self.ports()?;
        self.volumes()?;
        self.health_check()?;
        Ok(())
    }

    /// The stock `dinox-app` definition: Streamlit on 8501 with the
    /// `.env` file mounted read-only.
    pub fn scaffold(name: &str) -> Self {
        let mut environment = BTreeMap::new();
        environment.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());

        ServiceConfig {
            service: ServiceSection {
                name: name.to_string(),
                build: Some(".".to_string()),
                command: Some(vec![
                    "streamlit".to_string(),
                    "run".to_string(),
                    "app.py".to_string(),
                    "--server.port=8501".to_string(),
                ]),
                ports: vec!["8501:8501".to_string()],
                volumes: vec!["./.env:/app/.env".to_string()],
                environment,
                restart: RestartPolicy::UnlessStopped,
            },
            healthcheck: Some(HealthCheckConfig {
                url: Some(DEFAULT_HEALTH_URL.to_string()),
                interval: Some("30s".to_string()),
                timeout: Some("10s".to_string()),
                retries: Some(DEFAULT_RETRIES),
                start_period: None,
            }),
        }
    }
}

fn duration_field(field: &'static str, value: Option<&str>, default: Duration) -> ConfigResult<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw)
            .filter(|d| *d <= MAX_DURATION)
            .ok_or_else(|| ConfigError::InvalidDuration {
                field,
                value: raw.to_string(),
            }),
    }
}

/// Parse a duration string like "30s", "500ms", "1m", "2h".
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
