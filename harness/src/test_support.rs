//! Scripted collaborators for driving the pipeline without external tools.
//!
//! Every fake is cheaply cloneable and shares its recorded state, so a test
//! can hand one clone to [`crate::pipeline::Backends`] and inspect another.

use std::collections::VecDeque;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use crate::config::{HarnessConfig, HealthConfig, ShutdownConfig, VerificationConfig};
use crate::context::RunContext;
use crate::core::report::ArtifactKind;
use crate::io::agent::{AgentRequest, AgentRuntime};
use crate::io::process::InvocationOutcome;
use crate::io::server::{
    HealthProbe, ServerLauncher, ServerSpec, SupervisedServer, TerminateOutcome,
};
use crate::io::store::TrackingStore;
use crate::io::tracking_env::TrackingEnv;
use crate::io::workspace::{PackageManager, ProjectSource};

/// Scratch layout for one run: a skill directory and a runs directory in a
/// temporary root that is removed on drop.
pub struct TestRun {
    temp: TempDir,
    pub skill_dir: PathBuf,
    pub config: HarnessConfig,
}

impl TestRun {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let skill_dir = skill_dir(temp.path());
        let config = test_config(&temp.path().join("test-runs"));
        Ok(Self {
            temp,
            skill_dir,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Context for this layout with an optional external tracking URI.
    pub fn context(&self, tracking_uri: Option<&str>) -> RunContext {
        RunContext::new(
            self.config.clone(),
            self.skill_dir.clone(),
            "focus on latency".to_string(),
            tracking_uri.map(str::to_string),
            Some("sk-test".to_string()),
        )
    }
}

/// Create `<root>/skills/agent-evaluation` with a `SKILL.md`.
pub fn skill_dir(root: &Path) -> PathBuf {
    let dir = root.join("skills").join("agent-evaluation");
    fs::create_dir_all(&dir).expect("create skill dir");
    fs::write(dir.join("SKILL.md"), "# agent-evaluation\n").expect("write SKILL.md");
    dir
}

/// A localhost port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Config with fast polling, `sh` as the only required tool, and runs under `runs_dir`.
pub fn test_config(runs_dir: &Path) -> HarnessConfig {
    HarnessConfig {
        required_tools: vec!["sh".to_string()],
        port: free_port(),
        runs_dir: Some(runs_dir.to_path_buf()),
        health: HealthConfig {
            max_attempts: 3,
            interval_ms: 1,
            probe_timeout_ms: 10,
        },
        shutdown: ShutdownConfig {
            checks: 1,
            interval_ms: 1,
        },
        verification: VerificationConfig {
            attempts: 1,
            backoff_secs: 0,
        },
        ..HarnessConfig::default()
    }
}

/// Server stand-in that counts termination requests.
pub struct FakeServer {
    exited: bool,
    terminations: Arc<AtomicUsize>,
    log_path: PathBuf,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::with_counter(Arc::new(AtomicUsize::new(0)), PathBuf::from("fake-server.log"))
    }

    fn with_counter(terminations: Arc<AtomicUsize>, log_path: PathBuf) -> Self {
        Self {
            exited: false,
            terminations,
            log_path,
        }
    }

    pub fn terminations(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.terminations)
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisedServer for FakeServer {
    fn pid(&self) -> u32 {
        4242
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn terminate(&mut self, _shutdown: &ShutdownConfig) -> TerminateOutcome {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.exited {
            return TerminateOutcome::AlreadyGone;
        }
        self.exited = true;
        TerminateOutcome::Stopped
    }
}

struct FixedProbe(bool);

impl HealthProbe for FixedProbe {
    fn probe(&self) -> bool {
        self.0
    }
}

/// Launcher producing [`FakeServer`]s that report healthy (or never do).
#[derive(Clone)]
pub struct FakeLauncher {
    healthy: bool,
    launches: Arc<AtomicUsize>,
    terminations: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            launches: Arc::new(AtomicUsize::new(0)),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::healthy()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch(&self, spec: &ServerSpec) -> Result<Box<dyn SupervisedServer>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        fs::write(&spec.log_path, "fake tracking server\n")?;
        Ok(Box::new(FakeServer::with_counter(
            Arc::clone(&self.terminations),
            spec.log_path.clone(),
        )))
    }

    fn health_probe(&self, _spec: &ServerSpec, _timeout: Duration) -> Result<Box<dyn HealthProbe>> {
        Ok(Box::new(FixedProbe(self.healthy)))
    }
}

/// Store with fixed per-category counts that records every call.
#[derive(Clone)]
pub struct FakeStore {
    counts: [usize; 3],
    failing: Option<ArtifactKind>,
    experiment_id: String,
    workspace_user: Option<String>,
    count_calls: Arc<AtomicUsize>,
    created: Arc<Mutex<Vec<(String, TrackingEnv)>>>,
    count_envs: Arc<Mutex<Vec<TrackingEnv>>>,
}

impl FakeStore {
    pub fn with_counts(datasets: usize, scorers: usize, traces: usize) -> Self {
        Self {
            counts: [datasets, scorers, traces],
            failing: None,
            experiment_id: "E".to_string(),
            workspace_user: None,
            count_calls: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(Mutex::new(Vec::new())),
            count_envs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make queries for `kind` fail.
    pub fn failing(mut self, kind: ArtifactKind) -> Self {
        self.failing = Some(kind);
        self
    }

    pub fn with_workspace_user(mut self, user: &str) -> Self {
        self.workspace_user = Some(user.to_string());
        self
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    /// Names passed to `create_experiment`, with the environment used.
    pub fn created(&self) -> Vec<(String, TrackingEnv)> {
        self.created.lock().expect("lock").clone()
    }

    pub fn count_envs(&self) -> Vec<TrackingEnv> {
        self.count_envs.lock().expect("lock").clone()
    }
}

impl TrackingStore for FakeStore {
    fn create_experiment(&self, _project_dir: &Path, env: &TrackingEnv, name: &str) -> Result<String> {
        self.created
            .lock()
            .expect("lock")
            .push((name.to_string(), env.clone()));
        Ok(self.experiment_id.clone())
    }

    fn count(
        &self,
        _project_dir: &Path,
        env: &TrackingEnv,
        _experiment_id: &str,
        kind: ArtifactKind,
    ) -> Result<usize> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        self.count_envs.lock().expect("lock").push(env.clone());
        if self.failing == Some(kind) {
            bail!("scripted {kind} query failure");
        }
        let index = match kind {
            ArtifactKind::Datasets => 0,
            ArtifactKind::Scorers => 1,
            ArtifactKind::Traces => 2,
        };
        Ok(self.counts[index])
    }

    fn workspace_user(&self, profile: &str) -> Result<String> {
        self.workspace_user
            .clone()
            .ok_or_else(|| anyhow!("no workspace user for profile {profile}"))
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    output: String,
    exit_code: Option<i32>,
    timed_out: bool,
    unstartable: bool,
    writes_log: bool,
}

impl ScriptedRun {
    pub fn exits(code: i32, output: &str) -> Self {
        Self {
            output: output.to_string(),
            exit_code: Some(code),
            timed_out: false,
            unstartable: false,
            writes_log: true,
        }
    }

    pub fn times_out(partial_output: &str) -> Self {
        Self {
            output: partial_output.to_string(),
            exit_code: None,
            timed_out: true,
            unstartable: false,
            writes_log: true,
        }
    }

    pub fn unstartable() -> Self {
        Self {
            output: String::new(),
            exit_code: None,
            timed_out: false,
            unstartable: true,
            writes_log: false,
        }
    }

    /// Exits with `code` without ever creating its log file.
    pub fn without_log(code: i32) -> Self {
        Self {
            writes_log: false,
            ..Self::exits(code, "")
        }
    }
}

/// Agent that replays scripted runs in order and records each request.
#[derive(Clone)]
pub struct ScriptedAgent {
    runs: Arc<Mutex<VecDeque<ScriptedRun>>>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
    session_dir: Option<PathBuf>,
}

impl ScriptedAgent {
    pub fn new(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        Self {
            runs: Arc::new(Mutex::new(runs.into_iter().collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
            session_dir: None,
        }
    }

    /// Smoke test answers, then the evaluation run exits `code`.
    pub fn healthy_then_exits(code: i32) -> Self {
        Self::new([
            ScriptedRun::exits(0, "hello world"),
            ScriptedRun::exits(code, "evaluation transcript"),
        ])
    }

    pub fn with_session_dir(mut self, dir: PathBuf) -> Self {
        self.session_dir = Some(dir);
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

impl AgentRuntime for ScriptedAgent {
    fn invoke(&self, request: &AgentRequest) -> Result<InvocationOutcome> {
        self.requests.lock().expect("lock").push(request.clone());
        let run = self
            .runs
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted run left"))?;
        if run.unstartable {
            bail!("spawn scripted-agent: No such file or directory");
        }
        if run.writes_log {
            fs::write(&request.log_path, &run.output)?;
        }
        Ok(InvocationOutcome {
            exit_code: run.exit_code,
            timed_out: run.timed_out,
            duration: Duration::from_millis(5),
        })
    }

    fn session_log_dir(&self, _project_dir: &Path) -> Option<PathBuf> {
        self.session_dir.clone()
    }
}

/// Source that materializes an empty project with a `pyproject.toml`.
#[derive(Clone, Default)]
pub struct FakeSource {
    fetches: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ProjectSource for FakeSource {
    fn fetch(&self, dest: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(dest)?;
        fs::write(dest.join("pyproject.toml"), "[project]\nname = \"fake\"\n")?;
        Ok(())
    }
}

/// Package manager that records `sync`/`add` calls and can fail named packages.
#[derive(Clone, Default)]
pub struct RecordingPackages {
    calls: Arc<Mutex<Vec<String>>>,
    failing_package: Option<String>,
}

impl RecordingPackages {
    pub fn failing_on(package: &str) -> Self {
        Self {
            failing_package: Some(package.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }
}

impl PackageManager for RecordingPackages {
    fn sync(&self, _project_dir: &Path) -> Result<()> {
        self.calls.lock().expect("lock").push("sync".to_string());
        Ok(())
    }

    fn add(&self, _project_dir: &Path, packages: &[String]) -> Result<()> {
        self.calls
            .lock()
            .expect("lock")
            .push(format!("add {}", packages.join(" ")));
        if let Some(failing) = &self.failing_package {
            if packages.contains(failing) {
                bail!("scripted install failure for {failing}");
            }
        }
        Ok(())
    }
}
