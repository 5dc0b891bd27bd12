//! Health check probe logic.
//!
//! Performs HTTP health checks against the service endpoint and folds the
//! outcomes into a consecutive-failure state machine.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dinox_core::{HealthCheckSpec, HealthState, ProbeTarget};

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// The endpoint answered 2xx within the timeout.
    pub success: bool,
    /// Wall time spent on the attempt, including a timeout.
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    /// Unix timestamp (milliseconds) when the attempt started.
    pub timestamp: u64,
    /// Why the attempt failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency: Duration, timestamp: u64) -> Self {
        Self {
            success: true,
            latency,
            timestamp,
            detail: None,
        }
    }

    pub fn failed(latency: Duration, timestamp: u64, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            latency,
            timestamp,
            detail: Some(detail.into()),
        }
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// A source of probe results. One call is one attempt.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self) -> impl Future<Output = ProbeResult> + Send;
}

/// Probes an HTTP endpoint with a GET per attempt.
#[derive(Debug, Clone)]
pub struct HttpProber {
    target: ProbeTarget,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(target: ProbeTarget, timeout: Duration) -> Self {
        Self { target, timeout }
    }

    pub fn from_spec(spec: &HealthCheckSpec) -> Self {
        Self::new(spec.target.clone(), spec.timeout)
    }
}

impl Probe for HttpProber {
    fn probe(&self) -> impl Future<Output = ProbeResult> + Send {
        http_probe(&self.target, self.timeout)
    }
}

/// Tracks consecutive probe results for the service.
#[derive(Debug)]
pub struct HealthTracker {
    state: HealthState,
    consecutive_failures: u32,
    /// Failures before marking unhealthy.
    retries: u32,
    /// Grace window during which failures do not count while starting.
    start_period: Duration,
    created_at: Instant,
}

impl HealthTracker {
    pub fn new(spec: &HealthCheckSpec) -> Self {
        Self::with_retries(spec.retries, spec.start_period)
    }

    pub fn with_retries(retries: u32, start_period: Duration) -> Self {
        Self {
            state: HealthState::Starting,
            consecutive_failures: 0,
            retries,
            start_period,
            created_at: Instant::now(),
        }
    }

    /// Record a probe result and return the new health state.
    pub fn record(&mut self, result: &ProbeResult) -> HealthState {
        if result.success {
            self.consecutive_failures = 0;
            if self.state != HealthState::Healthy {
                info!(from = %self.state, latency_ms = result.latency.as_millis() as u64, "service is healthy");
            }
            self.state = HealthState::Healthy;
            return self.state;
        }

        if self.in_start_period() {
            debug!(detail = ?result.detail, "probe failure ignored during start period");
            return self.state;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.retries {
            if self.state != HealthState::Unhealthy {
                warn!(
                    failures = self.consecutive_failures,
                    retries = self.retries,
                    detail = ?result.detail,
                    "service marked unhealthy"
                );
            }
            self.state = HealthState::Unhealthy;
        } else {
            debug!(
                failures = self.consecutive_failures,
                retries = self.retries,
                detail = ?result.detail,
                "probe failed"
            );
        }

        self.state
    }

    fn in_start_period(&self) -> bool {
        self.state == HealthState::Starting && self.created_at.elapsed() < self.start_period
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Perform an HTTP health probe against a target.
///
/// Success means a 2xx response within `timeout`. A non-2xx status, a
/// connection error and a timeout are all failures; none are retried.
pub async fn http_probe(target: &ProbeTarget, timeout: Duration) -> ProbeResult {
    let authority = target.authority();
    let uri = target.url();
    let timestamp = epoch_millis();
    let started = Instant::now();

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(authority.as_str()).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return Err(format!("connect: {e}"));
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return Err(format!("handshake: {e}"));
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(target.path.as_str())
            .header("host", authority.as_str())
            .header("user-agent", "dinox-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| format!("request: {e}"))?;

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                Err(format!("status {}", resp.status()))
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                Err(format!("request: {e}"))
            }
        }
    })
    .await;

    let latency = started.elapsed();
    match result {
        Ok(Ok(())) => ProbeResult::healthy(latency, timestamp),
        Ok(Err(detail)) => ProbeResult::failed(latency, timestamp, detail),
        Err(_) => {
            debug!(%uri, timeout_ms = timeout.as_millis() as u64, "health probe timed out");
            ProbeResult::failed(latency, timestamp, format!("timed out after {timeout:?}"))
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
