//! Process supervisor — owns the service process and acts on
//! restart/stop/start commands.
//!
//! Unexpected exits are handled by the restart policy with a doubling
//! backoff (1s → 60s) that resets once the process has stayed up for a
//! while.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use dinox_core::{RestartPolicy, ServiceConfig};
use dinox_health::{StopFlag, SupervisorCommand};

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// A process that ran at least this long resets the backoff.
const STABLE_AFTER: Duration = Duration::from_secs(10);
/// Time between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Counters reported when the supervisor exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub starts: u32,
    pub restarts: u32,
}

struct RunningChild {
    child: Child,
    started_at: Instant,
}

pub struct ProcessSupervisor {
    service: String,
    command: Option<Vec<String>>,
    workdir: Option<PathBuf>,
    environment: BTreeMap<String, String>,
    policy: RestartPolicy,
    stop: StopFlag,
    child: Option<RunningChild>,
    /// When the next exit-triggered restart is due.
    pending_restart: Option<Instant>,
    base_backoff: Duration,
    max_backoff: Duration,
    backoff: Duration,
    stats: ProcessStats,
}

impl ProcessSupervisor {
    pub fn new(
        service: impl Into<String>,
        command: Option<Vec<String>>,
        policy: RestartPolicy,
        stop: StopFlag,
    ) -> Self {
        Self {
            service: service.into(),
            command,
            workdir: None,
            environment: BTreeMap::new(),
            policy,
            stop,
            child: None,
            pending_restart: None,
            base_backoff: BASE_BACKOFF,
            max_backoff: MAX_BACKOFF,
            backoff: BASE_BACKOFF,
            stats: ProcessStats::default(),
        }
    }

    /// Build from a service definition. Relative build contexts resolve
    /// against `base_dir` (the directory holding dinox.toml).
    pub fn from_config(config: &ServiceConfig, base_dir: &Path, stop: StopFlag) -> Self {
        let svc = &config.service;
        let mut supervisor = Self::new(svc.name.clone(), svc.command.clone(), svc.restart, stop)
            .with_environment(svc.environment.clone());
        if let Some(build) = &svc.build {
            supervisor = supervisor.with_workdir(base_dir.join(build));
        }
        supervisor
    }

    pub fn with_workdir(mut self, dir: PathBuf) -> Self {
        self.workdir = Some(dir);
        self
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self.backoff = base;
        self
    }

    /// Run until `shutdown` fires or the command channel closes, then stop
    /// the process.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SupervisorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<ProcessStats> {
        if self.command.is_none() {
            info!(service = %self.service, "no command configured; process is managed externally");
        } else if self.stop.is_set() {
            info!(service = %self.service, "stopped by operator; not starting");
        } else {
            // A command that cannot be spawned at all is a startup error.
            self.start()?;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                (exit, ran) = wait_exit(&mut self.child) => {
                    self.child = None;
                    self.on_exit(exit, ran);
                }
                _ = wait_deadline(self.pending_restart) => {
                    self.pending_restart = None;
                    self.restart_after_exit();
                }
            }
        }

        self.stop_child().await;
        info!(service = %self.service, starts = self.stats.starts, restarts = self.stats.restarts, "process supervisor stopped");
        Ok(self.stats)
    }

    async fn handle(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Restart { reason } => {
                if self.command.is_none() {
                    warn!(service = %self.service, %reason, "restart requested but no command configured; restart it externally");
                    return;
                }
                if self.stop.is_set() {
                    info!(service = %self.service, %reason, "restart ignored; stopped by operator");
                    return;
                }
                if self.pending_restart.is_some() {
                    info!(service = %self.service, %reason, "restart already scheduled after exit");
                    return;
                }
                info!(service = %self.service, %reason, "restarting process");
                self.stop_child().await;
                self.backoff = self.base_backoff;
                if self.start_logged() {
                    self.stats.restarts += 1;
                }
            }
            SupervisorCommand::Stop => {
                info!(service = %self.service, "stopping process");
                self.pending_restart = None;
                self.stop_child().await;
            }
            SupervisorCommand::Start => {
                if self.child.is_some() {
                    debug!(service = %self.service, "start requested; already running");
                } else if self.command.is_some() {
                    self.pending_restart = None;
                    self.backoff = self.base_backoff;
                    self.start_logged();
                }
            }
        }
    }

    /// Apply the restart policy to an unexpected exit, scheduling the
    /// restart after the current backoff.
    fn on_exit(&mut self, exit: std::io::Result<ExitStatus>, ran: Duration) {
        let code = match &exit {
            Ok(status) => {
                warn!(service = %self.service, exit_code = ?status.code(), ran_ms = ran.as_millis() as u64, "process exited");
                status.code()
            }
            Err(e) => {
                error!(service = %self.service, error = %e, "failed to wait on process");
                None
            }
        };

        if self.stop.is_set() {
            info!(service = %self.service, "stopped by operator; not restarting");
            return;
        }
        if !self.policy.restarts_on_exit(code) {
            info!(service = %self.service, policy = %self.policy, "restart policy leaves process down");
            return;
        }

        if ran >= STABLE_AFTER {
            self.backoff = self.base_backoff;
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.max_backoff);

        info!(service = %self.service, delay_ms = delay.as_millis() as u64, "restarting process after exit");
        self.pending_restart = Some(Instant::now() + delay);
    }

    fn restart_after_exit(&mut self) {
        // The operator may have stopped the service while we waited.
        if self.stop.is_set() || self.child.is_some() {
            return;
        }
        if self.start_logged() {
            self.stats.restarts += 1;
        }
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let Some(argv) = &self.command else {
            return Ok(());
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty command for service {}", self.service))?;

        let mut cmd = Command::new(program);
        cmd.args(args).envs(&self.environment).kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn {program:?} for service {}: {e}", self.service))?;
        info!(service = %self.service, pid = ?child.id(), %program, "process started");

        self.child = Some(RunningChild {
            child,
            started_at: Instant::now(),
        });
        self.stats.starts += 1;
        Ok(())
    }

    fn start_logged(&mut self) -> bool {
        match self.start() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "process start failed");
                false
            }
        }
    }

    async fn stop_child(&mut self) {
        let Some(mut running) = self.child.take() else {
            return;
        };

        terminate(&mut running.child);
        match tokio::time::timeout(STOP_GRACE, running.child.wait()).await {
            Ok(Ok(status)) => info!(service = %self.service, exit_code = ?status.code(), "process stopped"),
            Ok(Err(e)) => warn!(service = %self.service, error = %e, "failed to wait on stopped process"),
            Err(_) => {
                warn!(service = %self.service, "process ignored SIGTERM; killing");
                if let Err(e) = running.child.kill().await {
                    error!(service = %self.service, error = %e, "failed to kill process");
                }
            }
        }
    }
}

/// Resolves when the running child exits; pending forever with no child.
async fn wait_exit(child: &mut Option<RunningChild>) -> (std::io::Result<ExitStatus>, Duration) {
    match child {
        Some(running) => {
            let exit = running.child.wait().await;
            (exit, running.started_at.elapsed())
        }
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Option<Vec<String>> {
        Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    fn supervisor(command: Option<Vec<String>>, policy: RestartPolicy, stop: StopFlag) -> ProcessSupervisor {
        ProcessSupervisor::new("dinox-app", command, policy, stop)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
    }

    struct Harness {
        commands: mpsc::Sender<SupervisorCommand>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<anyhow::Result<ProcessStats>>,
    }

    impl Harness {
        fn start(supervisor: ProcessSupervisor) -> Self {
            let (commands, rx) = mpsc::channel(8);
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(supervisor.run(rx, shutdown_rx));
            Self { commands, shutdown, task }
        }

        async fn finish(self) -> ProcessStats {
            self.shutdown.send(true).unwrap();
            self.task.await.unwrap().unwrap()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn no_command_ignores_restart() {
        let h = Harness::start(supervisor(None, RestartPolicy::UnlessStopped, StopFlag::new()));
        h.commands
            .send(SupervisorCommand::Restart { reason: "test".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.finish().await, ProcessStats::default());
    }

    #[tokio::test]
    async fn restart_command_replaces_running_process() {
        let h = Harness::start(supervisor(sh("exec sleep 30"), RestartPolicy::UnlessStopped, StopFlag::new()));
        h.commands
            .send(SupervisorCommand::Restart { reason: "unhealthy".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.finish().await, ProcessStats { starts: 2, restarts: 1 });
    }

    #[tokio::test]
    async fn restart_ignored_when_stopped_by_operator() {
        let stop = StopFlag::new();
        let h = Harness::start(supervisor(sh("exec sleep 30"), RestartPolicy::UnlessStopped, stop.clone()));
        settle().await;
        stop.set();
        h.commands
            .send(SupervisorCommand::Restart { reason: "unhealthy".into() })
            .await
            .unwrap();
        settle().await;
        assert_eq!(h.finish().await, ProcessStats { starts: 1, restarts: 0 });
    }

    #[tokio::test]
    async fn stopped_flag_prevents_initial_start() {
        let stop = StopFlag::new();
        stop.set();
        let h = Harness::start(supervisor(sh("exec sleep 30"), RestartPolicy::Always, stop));
        settle().await;
        assert_eq!(h.finish().await.starts, 0);
    }

    #[tokio::test]
    async fn stop_then_start() {
        let stop = StopFlag::new();
        let h = Harness::start(supervisor(sh("exec sleep 30"), RestartPolicy::UnlessStopped, stop.clone()));

        stop.set();
        h.commands.send(SupervisorCommand::Stop).await.unwrap();
        settle().await;

        stop.clear();
        h.commands.send(SupervisorCommand::Start).await.unwrap();
        h.commands.send(SupervisorCommand::Start).await.unwrap();
        settle().await;

        assert_eq!(h.finish().await, ProcessStats { starts: 2, restarts: 0 });
    }

    #[tokio::test]
    async fn on_failure_restarts_non_zero_exit() {
        let h = Harness::start(supervisor(sh("exit 3"), RestartPolicy::OnFailure, StopFlag::new()));
        settle().await;
        let stats = h.finish().await;
        assert!(stats.starts >= 2, "{stats:?}");
        assert_eq!(stats.restarts, stats.starts - 1);
    }

    #[tokio::test]
    async fn on_failure_leaves_clean_exit_down() {
        let h = Harness::start(supervisor(sh("exit 0"), RestartPolicy::OnFailure, StopFlag::new()));
        settle().await;
        assert_eq!(h.finish().await.starts, 1);
    }

    #[tokio::test]
    async fn policy_no_never_restarts() {
        let h = Harness::start(supervisor(sh("exit 1"), RestartPolicy::No, StopFlag::new()));
        settle().await;
        assert_eq!(h.finish().await.starts, 1);
    }

    #[tokio::test]
    async fn restart_during_exit_backoff_is_coalesced() {
        let h = Harness::start(
            ProcessSupervisor::new("dinox-app", sh("exit 1"), RestartPolicy::Always, StopFlag::new())
                .with_backoff(Duration::from_secs(1), Duration::from_secs(1)),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.commands
            .send(SupervisorCommand::Restart { reason: "unhealthy".into() })
            .await
            .unwrap();

        // Past the backoff, before the next one expires.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.finish().await, ProcessStats { starts: 2, restarts: 1 });
    }

    #[tokio::test]
    async fn commands_are_served_during_exit_backoff() {
        let stop = StopFlag::new();
        let h = Harness::start(
            ProcessSupervisor::new("dinox-app", sh("exit 1"), RestartPolicy::Always, stop.clone())
                .with_backoff(Duration::from_secs(1), Duration::from_secs(1)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        stop.set();
        h.commands.send(SupervisorCommand::Stop).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Start runs right away instead of waiting out the backoff.
        stop.clear();
        h.commands.send(SupervisorCommand::Start).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(h.finish().await, ProcessStats { starts: 2, restarts: 0 });
    }

    #[tokio::test]
    async fn environment_is_passed_through() {
        let mut env = BTreeMap::new();
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        let sup = supervisor(sh("test \"$PYTHONUNBUFFERED\" = 1"), RestartPolicy::OnFailure, StopFlag::new())
            .with_environment(env);
        let h = Harness::start(sup);
        settle().await;
        // A clean exit proves the variable arrived; on-failure leaves it down.
        assert_eq!(h.finish().await.starts, 1);
    }

    #[tokio::test]
    async fn unspawnable_command_fails_startup() {
        let sup = supervisor(
            Some(vec!["/nonexistent/dinox-app".to_string()]),
            RestartPolicy::UnlessStopped,
            StopFlag::new(),
        );
        let (_tx, rx) = mpsc::channel(1);
        let (_shutdown, shutdown_rx) = watch::channel(false);
        assert!(sup.run(rx, shutdown_rx).await.is_err());
    }
}
