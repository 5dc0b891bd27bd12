//! Supervisor regression tests.
//!
//! Wires the health monitor, restart enforcer, and status API the way the
//! daemon does, against a stand-in service endpoint, and drives them over
//! HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use tokio::sync::mpsc;
use tower::ServiceExt;

use dinox_api::{ApiState, build_router};
use dinox_core::{HealthCheckSpec, HealthState, ProbeTarget, RestartPolicy, ServiceConfig};
use dinox_health::*;

/// A stand-in for the Streamlit app: `/_stcore/health` answers 200 or 500.
async fn fake_app(healthy: Arc<AtomicBool>) -> SocketAddr {
    let router = Router::new()
        .route(
            "/_stcore/health",
            get(|State(healthy): State<Arc<AtomicBool>>| async move {
                if healthy.load(Ordering::SeqCst) {
                    StatusCode::OK
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        )
        .with_state(healthy);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn fast_spec(addr: SocketAddr) -> HealthCheckSpec {
    HealthCheckSpec {
        target: ProbeTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            path: "/_stcore/health".to_string(),
        },
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(500),
        retries: 3,
        start_period: Duration::ZERO,
    }
}

struct Supervisor {
    router: Router,
    commands: mpsc::Receiver<SupervisorCommand>,
    monitor: MonitorHandle,
}

fn supervise(spec: HealthCheckSpec, policy: RestartPolicy) -> Supervisor {
    let stop = StopFlag::new();
    let (tx, rx) = mpsc::channel(16);
    let enforcer = RestartEnforcer::new(policy, stop.clone(), tx.clone());
    let monitor = HealthMonitor::new(spec.clone(), HttpProber::from_spec(&spec), enforcer).spawn();
    let router = build_router(ApiState {
        service: "dinox-app".to_string(),
        status: monitor.status(),
        stop,
        commands: tx,
    });
    Supervisor {
        router,
        commands: rx,
        monitor,
    }
}

async fn status_json(router: &Router) -> serde_json::Value {
    let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post(router: &Router, uri: &str) -> StatusCode {
    let req = Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap();
    router.clone().oneshot(req).await.unwrap().status()
}

async fn wait_for_state(monitor: &MonitorHandle, state: HealthState) -> HealthSnapshot {
    let mut status = monitor.status();
    let snap = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.state == state))
        .await
        .expect("state not reached in time")
        .expect("monitor stopped")
        .clone();
    snap
}

#[tokio::test]
async fn healthy_service_reports_healthy() {
    let healthy = Arc::new(AtomicBool::new(true));
    let addr = fake_app(healthy).await;
    let sup = supervise(fast_spec(addr), RestartPolicy::UnlessStopped);

    wait_for_state(&sup.monitor, HealthState::Healthy).await;

    let json = status_json(&sup.router).await;
    assert_eq!(json["data"]["state"], "healthy");
    assert_eq!(json["data"]["consecutive_failures"], 0);
    assert_eq!(json["data"]["last_probe"]["success"], true);

    sup.monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn unhealthy_service_is_restarted_once() {
    let healthy = Arc::new(AtomicBool::new(true));
    let addr = fake_app(healthy.clone()).await;
    let mut sup = supervise(fast_spec(addr), RestartPolicy::UnlessStopped);

    wait_for_state(&sup.monitor, HealthState::Healthy).await;
    healthy.store(false, Ordering::SeqCst);
    let snap = wait_for_state(&sup.monitor, HealthState::Unhealthy).await;
    assert_eq!(snap.restarts_requested, 1);

    let cmd = tokio::time::timeout(Duration::from_secs(5), sup.commands.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(cmd, SupervisorCommand::Restart { .. }));

    // More failures while still unhealthy do not repeat the request.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(sup.commands.try_recv().is_err());

    let json = status_json(&sup.router).await;
    assert_eq!(json["data"]["state"], "unhealthy");
    assert_eq!(json["data"]["restarts_requested"], 1);

    sup.monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn operator_stop_prevents_restart() {
    let healthy = Arc::new(AtomicBool::new(true));
    let addr = fake_app(healthy.clone()).await;
    let mut sup = supervise(fast_spec(addr), RestartPolicy::UnlessStopped);

    wait_for_state(&sup.monitor, HealthState::Healthy).await;

    assert_eq!(post(&sup.router, "/service/stop").await, StatusCode::ACCEPTED);
    assert_eq!(sup.commands.recv().await, Some(SupervisorCommand::Stop));

    healthy.store(false, Ordering::SeqCst);
    let snap = wait_for_state(&sup.monitor, HealthState::Unhealthy).await;
    assert_eq!(snap.restarts_requested, 0);
    assert!(sup.commands.try_recv().is_err());

    let json = status_json(&sup.router).await;
    assert_eq!(json["data"]["stopped_by_operator"], true);

    sup.monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn policy_no_leaves_unhealthy_service_alone() {
    let healthy = Arc::new(AtomicBool::new(false));
    let addr = fake_app(healthy).await;
    let mut sup = supervise(fast_spec(addr), RestartPolicy::No);

    let snap = wait_for_state(&sup.monitor, HealthState::Unhealthy).await;
    assert_eq!(snap.restarts_requested, 0);
    assert!(sup.commands.try_recv().is_err());

    sup.monitor.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_service_becomes_unhealthy() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sup = supervise(fast_spec(addr), RestartPolicy::UnlessStopped);
    let snap = wait_for_state(&sup.monitor, HealthState::Unhealthy).await;
    assert!(snap.consecutive_failures >= 3);
    assert!(!snap.last_probe.unwrap().success);

    sup.monitor.shutdown().await.unwrap();
}

#[test]
fn default_definition_matches_deployment() {
    let config = ServiceConfig::scaffold("dinox-app");
    config.validate().unwrap();

    let spec = config.health_check().unwrap();
    assert_eq!(spec.url(), "http://localhost:8501/_stcore/health");
    assert_eq!(spec.interval, Duration::from_secs(30));
    assert_eq!(spec.timeout, Duration::from_secs(10));
    assert_eq!(spec.retries, 3);

    assert_eq!(config.service.restart, RestartPolicy::UnlessStopped);
    assert_eq!(config.ports().unwrap()[0].to_string(), "8501:8501");
    assert_eq!(config.volumes().unwrap()[0].container, "/app/.env");
    assert_eq!(config.service.environment["PYTHONUNBUFFERED"], "1");
}
