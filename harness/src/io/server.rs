//! Supervision of the local tracking server.
//!
//! The server runs in its own process group so the stop signal reaches the
//! `uv` wrapper and the interpreter it launches. Termination is graceful only:
//! a stop signal followed by a bounded number of exit checks, never a kill.

use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::config::ShutdownConfig;
use crate::io::process::read_tail;

const LOG_TAIL_BYTES: u64 = 8 * 1024;

/// Lightweight liveness check against the server's health surface.
pub trait HealthProbe {
    fn probe(&self) -> bool;
}

/// Probe that treats any 2xx from `GET <base>/health` as healthy.
pub struct HttpHealthProbe {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpHealthProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build health probe client")?;
        Ok(Self {
            url: format!("{}/health", base_url.trim_end_matches('/')),
            client,
        })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self) -> bool {
        match self.client.get(&self.url).send() {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(url = %self.url, err = %err, "health probe failed");
                false
            }
        }
    }
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process exited after the stop signal.
    Stopped,
    /// The process had already exited before the stop signal.
    AlreadyGone,
    /// The process was still alive after the last exit check.
    StillRunning,
}

/// A spawned long-running server the harness is responsible for stopping.
pub trait SupervisedServer: Send {
    fn pid(&self) -> u32;
    /// Non-blocking check whether the process has exited.
    fn has_exited(&mut self) -> bool;
    fn log_path(&self) -> &Path;
    /// Send the stop signal and wait (bounded) for exit. Never blocks past the
    /// configured checks and never fails.
    fn terminate(&mut self, shutdown: &ShutdownConfig) -> TerminateOutcome;
}

/// Everything needed to start a server for one run.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    /// Directory the server command runs in (the project checkout).
    pub project_dir: PathBuf,
    /// Root for the backend store file and artifact directory.
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub log_path: PathBuf,
}

impl ServerSpec {
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Starts the server process described by a [`ServerSpec`].
pub trait ServerLauncher {
    fn launch(&self, spec: &ServerSpec) -> Result<Box<dyn SupervisedServer>>;

    /// Health probe for a server launched from `spec`.
    fn health_probe(&self, spec: &ServerSpec, timeout: Duration) -> Result<Box<dyn HealthProbe>>;
}

/// Launches `mlflow server` through `uv run` with a SQLite backend.
pub struct MlflowServerLauncher;

impl ServerLauncher for MlflowServerLauncher {
    fn health_probe(&self, spec: &ServerSpec, timeout: Duration) -> Result<Box<dyn HealthProbe>> {
        Ok(Box::new(HttpHealthProbe::new(&spec.address(), timeout)?))
    }

    #[instrument(skip_all, fields(port = spec.port))]
    fn launch(&self, spec: &ServerSpec) -> Result<Box<dyn SupervisedServer>> {
        let artifacts = spec.data_dir.join("artifacts");
        fs::create_dir_all(&artifacts)
            .with_context(|| format!("create {}", artifacts.display()))?;
        let backend_store = format!("sqlite:///{}", spec.data_dir.join("mlflow.db").display());

        info!(backend_store = %backend_store, artifact_root = %artifacts.display(), "starting tracking server");
        let mut cmd = Command::new("uv");
        cmd.args(["run", "python", "-m", "mlflow", "server", "--host"])
            .arg(&spec.host)
            .arg("--port")
            .arg(spec.port.to_string())
            .arg("--backend-store-uri")
            .arg(&backend_store)
            .arg("--default-artifact-root")
            .arg(&artifacts)
            .current_dir(&spec.project_dir);

        let server = ServerProcess::spawn(cmd, &spec.log_path)?;
        Ok(Box::new(server))
    }
}

/// A child process in its own process group with output sent to a log file.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    log_path: PathBuf,
}

impl ServerProcess {
    pub fn spawn(mut cmd: Command, log_path: &Path) -> Result<Self> {
        let log = File::create(log_path)
            .with_context(|| format!("create server log {}", log_path.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("clone server log handle {}", log_path.display()))?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);

        let program = cmd.get_program().to_string_lossy().into_owned();
        let child = cmd
            .spawn()
            .with_context(|| format!("spawn server {program}"))?;
        debug!(pid = child.id(), "server spawned");
        Ok(Self {
            child,
            log_path: log_path.to_path_buf(),
        })
    }

    fn signal_group(&self, signal: impl Into<Option<Signal>>) -> Result<(), Errno> {
        let pgid = i32::try_from(self.child.id()).map_err(|_| Errno::EINVAL)?;
        killpg(Pid::from_raw(pgid), signal)
    }

    /// With a live leader, its exit ends the wait. Once the leader is gone
    /// only the group can be watched.
    fn stopped(&mut self, leader_gone: bool) -> bool {
        if leader_gone {
            self.signal_group(None) == Err(Errno::ESRCH)
        } else {
            self.has_exited()
        }
    }
}

impl SupervisedServer for ServerProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(status = ?status.code(), "server exited");
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(err = %err, "could not poll server status");
                false
            }
        }
    }

    fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// The whole group is signalled even when the leader already exited, so
    /// an interpreter left behind by the `uv` wrapper still gets the signal.
    #[instrument(skip_all, fields(pid = self.child.id()))]
    fn terminate(&mut self, shutdown: &ShutdownConfig) -> TerminateOutcome {
        let leader_gone = self.has_exited();
        match self.signal_group(Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return TerminateOutcome::AlreadyGone,
            Err(err) => {
                warn!(err = %err, "failed to signal server process group");
                return TerminateOutcome::StillRunning;
            }
        }
        for _ in 0..shutdown.checks {
            if self.stopped(leader_gone) {
                return TerminateOutcome::Stopped;
            }
            thread::sleep(shutdown.interval());
        }
        if self.stopped(leader_gone) {
            return TerminateOutcome::Stopped;
        }
        warn!(
            checks = shutdown.checks,
            "server still running after stop signal; leaving it"
        );
        TerminateOutcome::StillRunning
    }
}

/// Result of waiting for the server to become healthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Ready { probes: u32 },
    /// The process exited before becoming healthy.
    Crashed { probes: u32, log_tail: String },
    /// The attempt ceiling was reached with the process still alive.
    Unresponsive { probes: u32, log_tail: String },
}

/// Poll `probe` until it succeeds, the process exits, or `max_attempts` probes ran.
///
/// Each attempt probes first and only then checks for process exit, so a
/// server healthy on probe `k` returns after exactly `k` probes. An exited
/// process aborts polling immediately instead of waiting out the ceiling.
#[instrument(skip_all, fields(pid = server.pid(), max_attempts))]
pub fn wait_until_healthy(
    server: &mut dyn SupervisedServer,
    probe: &dyn HealthProbe,
    max_attempts: u32,
    interval: Duration,
) -> HealthOutcome {
    for attempt in 1..=max_attempts {
        if probe.probe() {
            debug!(attempt, "server healthy");
            return HealthOutcome::Ready { probes: attempt };
        }
        if server.has_exited() {
            warn!(attempt, "server exited before becoming healthy");
            return HealthOutcome::Crashed {
                probes: attempt,
                log_tail: log_tail(server.log_path()),
            };
        }
        if attempt < max_attempts {
            thread::sleep(interval);
        }
    }
    warn!(max_attempts, "server did not become healthy");
    HealthOutcome::Unresponsive {
        probes: max_attempts,
        log_tail: log_tail(server.log_path()),
    }
}

fn log_tail(path: &Path) -> String {
    read_tail(path, LOG_TAIL_BYTES).unwrap_or_else(|err| format!("<log unavailable: {err:#}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ScriptedProbe {
        healthy_on: Option<u32>,
        calls: Cell<u32>,
    }

    impl ScriptedProbe {
        fn healthy_on(k: u32) -> Self {
            Self {
                healthy_on: Some(k),
                calls: Cell::new(0),
            }
        }

        fn never() -> Self {
            Self {
                healthy_on: None,
                calls: Cell::new(0),
            }
        }
    }

    impl HealthProbe for ScriptedProbe {
        fn probe(&self) -> bool {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            self.healthy_on.is_some_and(|k| n >= k)
        }
    }

    fn spawn_sh(script: &str, log: &Path) -> ServerProcess {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        ServerProcess::spawn(cmd, log).expect("spawn")
    }

    fn fast_shutdown() -> ShutdownConfig {
        ShutdownConfig {
            checks: 20,
            interval_ms: 50,
        }
    }

    #[test]
    fn ready_after_exactly_k_probes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut server = spawn_sh("sleep 30", &temp.path().join("server.log"));
        let probe = ScriptedProbe::healthy_on(3);

        let outcome = wait_until_healthy(&mut server, &probe, 10, Duration::from_millis(10));

        assert_eq!(outcome, HealthOutcome::Ready { probes: 3 });
        assert_eq!(probe.calls.get(), 3);
        assert_eq!(server.terminate(&fast_shutdown()), TerminateOutcome::Stopped);
    }

    #[test]
    fn crashed_process_fails_before_ceiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut server = spawn_sh("echo port in use; exit 1", &temp.path().join("server.log"));
        let probe = ScriptedProbe::never();

        let outcome = wait_until_healthy(&mut server, &probe, 200, Duration::from_millis(20));

        match outcome {
            HealthOutcome::Crashed { probes, log_tail } => {
                assert!(probes < 200, "expected fail-fast, got {probes} probes");
                assert!(log_tail.contains("port in use"));
            }
            other => panic!("expected crash, got {other:?}"),
        }
    }

    #[test]
    fn hung_process_exhausts_ceiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut server = spawn_sh("sleep 30", &temp.path().join("server.log"));
        let probe = ScriptedProbe::never();

        let outcome = wait_until_healthy(&mut server, &probe, 3, Duration::from_millis(10));

        assert!(matches!(outcome, HealthOutcome::Unresponsive { probes: 3, .. }));
        assert_eq!(probe.calls.get(), 3);
        assert_eq!(server.terminate(&fast_shutdown()), TerminateOutcome::Stopped);
    }

    #[test]
    fn terminate_reports_already_gone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut server = spawn_sh("exit 0", &temp.path().join("server.log"));
        for _ in 0..100 {
            if server.has_exited() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(server.terminate(&fast_shutdown()), TerminateOutcome::AlreadyGone);
    }

    #[test]
    fn terminate_signals_group_left_behind_by_exited_leader() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ready = temp.path().join("ready");
        let marker = temp.path().join("terminated");
        let script = format!(
            "(trap 'echo done > {}; exit 0' TERM; touch {}; while :; do sleep 0.1; done) & exit 0",
            marker.display(),
            ready.display()
        );
        let mut server = spawn_sh(&script, &temp.path().join("server.log"));
        for _ in 0..250 {
            if server.has_exited() && ready.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(server.has_exited());
        assert_eq!(server.signal_group(None), Ok(()), "background job should remain");

        let outcome = server.terminate(&fast_shutdown());
        assert_ne!(outcome, TerminateOutcome::AlreadyGone);
        for _ in 0..250 {
            if marker.exists() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(marker.exists(), "leftover group member never saw the stop signal");
    }

    #[test]
    fn terminate_does_not_escalate_when_signal_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut server = spawn_sh(
            "trap '' TERM; while :; do sleep 1; done",
            &temp.path().join("server.log"),
        );
        thread::sleep(Duration::from_millis(100));

        let shutdown = ShutdownConfig {
            checks: 3,
            interval_ms: 20,
        };
        assert_eq!(server.terminate(&shutdown), TerminateOutcome::StillRunning);
        assert!(!server.has_exited());

        server.signal_group(Signal::SIGKILL).expect("kill group");
        for _ in 0..100 {
            if server.has_exited() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn spec_address_formats_base_url() {
        let spec = ServerSpec {
            project_dir: PathBuf::from("/p"),
            data_dir: PathBuf::from("/p/data"),
            host: "127.0.0.1".to_string(),
            port: 5000,
            log_path: PathBuf::from("/p/server.log"),
        };
        assert_eq!(spec.address(), "http://127.0.0.1:5000");
    }
}
