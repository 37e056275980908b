//! The five-phase run: Prerequisites, Setup, Smoke Test, Execution, Verification.
//!
//! Phases run strictly in order and the first failure ends the run. Anything a
//! phase creates is registered with the [`CleanupScope`] before the next side
//! effect, so teardown is correct wherever the run stops.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{error, info, instrument, warn};

use crate::cleanup::{CleanupScope, RunSummary};
use crate::config::{HarnessConfig, TimeoutPolicy};
use crate::context::{RunContext, ServerInfo};
use crate::core::naming::{databricks_profile, experiment_name};
use crate::core::prompt::evaluation_prompt;
use crate::core::report::VerificationReport;
use crate::core::smoke::{SmokeVerdict, assess};
use crate::failure::PhaseFailure;
use crate::io::agent::{AgentRequest, AgentRuntime, ClaudeCli};
use crate::io::process::{ForegroundChild, read_tail};
use crate::io::server::{
    HealthOutcome, MlflowServerLauncher, ServerLauncher, ServerSpec, wait_until_healthy,
};
use crate::io::store::{MlflowStore, TrackingStore};
use crate::io::tools::{missing_tools, port_available};
use crate::io::tracking_env::TrackingEnv;
use crate::io::workspace::{
    GitCheckout, PackageManager, ProjectSource, UvPackages, create_workdir, install_skill,
    write_json,
};
use crate::verify::verify_with_retry;

const SKILL_MARKER: &str = "SKILL.md";
const SERVER_DATA_DIR: &str = "mlflow-data";
const SERVER_LOG: &str = "mlflow-server.log";
const SMOKE_LOG: &str = "smoke_test.log";
const EXECUTION_LOG: &str = "claude_output.log";
const REPORT_FILE: &str = "verification.json";
const DATABRICKS_PACKAGES: [&str; 2] = ["databricks-agents", "databricks-connect"];
const SMOKE_OUTPUT_BYTES: u64 = 64 * 1024;

/// External collaborators the pipeline drives.
pub struct Backends {
    pub source: Box<dyn ProjectSource>,
    pub packages: Box<dyn PackageManager>,
    pub launcher: Box<dyn ServerLauncher>,
    pub store: Box<dyn TrackingStore>,
    pub agent: Box<dyn AgentRuntime>,
}

impl Backends {
    /// `git`, `uv`, `mlflow` and the agent CLI. Agent invocations are
    /// published in `foreground` so cleanup can stop them.
    pub fn production(config: &HarnessConfig, foreground: ForegroundChild) -> Self {
        Self {
            source: Box::new(GitCheckout::new(
                config.project_repo.clone(),
                config.setup_command_timeout(),
            )),
            packages: Box::new(UvPackages::new(config.setup_command_timeout())),
            launcher: Box::new(MlflowServerLauncher),
            store: Box::new(MlflowStore::new(config.store_query_timeout())),
            agent: Box::new(
                ClaudeCli::new(config.agent.command.clone()).with_foreground(foreground),
            ),
        }
    }
}

/// Run every phase. On success the report is also stored in `ctx.report`.
pub fn run_pipeline(
    ctx: &mut RunContext,
    backends: &Backends,
    scope: &CleanupScope,
) -> Result<VerificationReport, PhaseFailure> {
    let result = run_phases(ctx, backends, scope);
    if let Err(failure) = &result {
        error!(phase = %failure.phase(), exit_code = failure.exit_code(), "{failure}");
    }
    result
}

fn run_phases(
    ctx: &mut RunContext,
    backends: &Backends,
    scope: &CleanupScope,
) -> Result<VerificationReport, PhaseFailure> {
    check_prerequisites(ctx, scope)?;
    setup(ctx, backends, scope)?;
    smoke_test(ctx, backends)?;
    execute(ctx, backends, scope)?;
    verify_artifacts(ctx, backends)
}

#[instrument(skip_all, fields(phase = "prerequisites"))]
pub fn check_prerequisites(ctx: &mut RunContext, scope: &CleanupScope) -> Result<(), PhaseFailure> {
    info!("checking prerequisites");
    let missing = missing_tools(&ctx.config.required_tools);
    if !missing.is_empty() {
        return Err(PhaseFailure::PrerequisiteUnmet(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )));
    }

    if !ctx.skill_dir.is_dir() {
        return Err(PhaseFailure::PrerequisiteUnmet(format!(
            "skill directory not found: {}",
            ctx.skill_dir.display()
        )));
    }
    if !ctx.skill_dir.join(SKILL_MARKER).is_file() {
        return Err(PhaseFailure::PrerequisiteUnmet(format!(
            "{SKILL_MARKER} not found in {}",
            ctx.skill_dir.display()
        )));
    }

    if let Some(uri) = &ctx.external_tracking_uri {
        info!(tracking_uri = %uri, "using external tracking endpoint");
        ctx.using_external_endpoint = true;
        scope.mark_external_endpoint();
    } else if !port_available(&ctx.config.server_host, ctx.config.port) {
        return Err(PhaseFailure::PrerequisiteUnmet(format!(
            "port {} is already in use; pass --mlflow-port to pick another",
            ctx.config.port
        )));
    }

    info!("prerequisites satisfied");
    Ok(())
}

#[instrument(skip_all, fields(phase = "setup"))]
pub fn setup(
    ctx: &mut RunContext,
    backends: &Backends,
    scope: &CleanupScope,
) -> Result<(), PhaseFailure> {
    let work_dir = create_workdir(&ctx.runs_dir()).map_err(PhaseFailure::setup)?;
    scope.register_work_dir(&work_dir);
    ctx.work_dir = Some(work_dir.clone());
    info!(work_dir = %work_dir.display(), "created working directory");

    let project_dir = work_dir.join(ctx.config.project_dir_name());
    backends
        .source
        .fetch(&project_dir)
        .map_err(PhaseFailure::setup)?;
    ctx.project_dir = Some(project_dir.clone());
    scope.set_session_source(backends.agent.session_log_dir(&project_dir));

    let installed = install_skill(&ctx.skill_dir, &project_dir).map_err(PhaseFailure::setup)?;
    info!(dest = %installed.display(), "installed skill");

    backends
        .packages
        .sync(&project_dir)
        .map_err(PhaseFailure::setup)?;
    backends
        .packages
        .add(&project_dir, &ctx.config.extra_packages)
        .map_err(PhaseFailure::setup)?;

    let profile = ctx
        .external_tracking_uri
        .as_deref()
        .and_then(databricks_profile)
        .map(str::to_string);
    if profile.is_some() {
        let packages: Vec<String> = DATABRICKS_PACKAGES.iter().map(|p| p.to_string()).collect();
        if let Err(err) = backends.packages.add(&project_dir, &packages) {
            warn!(err = %format!("{err:#}"), "could not install Databricks packages; continuing");
        }
    }

    if ctx.external_tracking_uri.is_none() {
        start_local_server(ctx, backends, scope, &work_dir, &project_dir)?;
    }
    let tracking_uri = ctx
        .tracking_uri()
        .map(str::to_string)
        .ok_or_else(|| PhaseFailure::Setup("no tracking endpoint".to_string()))?;
    let base_env =
        TrackingEnv::new(tracking_uri.clone()).with_openai_api_key(ctx.openai_api_key.clone());

    let workspace_user = match &profile {
        Some(profile) => {
            let user = backends.store.workspace_user(profile).map_err(|err| {
                PhaseFailure::Setup(format!(
                    "could not resolve Databricks user for profile {profile}: {err:#}"
                ))
            })?;
            Some(user)
        }
        None => None,
    };

    let timestamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let name = experiment_name(&timestamp, workspace_user.as_deref());
    let experiment_id = backends
        .store
        .create_experiment(&project_dir, &base_env, &name)
        .map_err(|err| PhaseFailure::Setup(format!("create experiment {name}: {err:#}")))?;
    info!(experiment = %name, experiment_id = %experiment_id, "created experiment");

    ctx.experiment_name = Some(name);
    ctx.experiment_id = Some(experiment_id.clone());
    ctx.tracking_env = Some(base_env.with_experiment(experiment_id.clone()));
    scope.record_summary(RunSummary {
        log_file: None,
        tracking_uri: Some(tracking_uri),
        experiment_id: Some(experiment_id),
        server_data_dir: ctx.server.as_ref().map(|server| server.data_dir.clone()),
    });
    Ok(())
}

fn start_local_server(
    ctx: &mut RunContext,
    backends: &Backends,
    scope: &CleanupScope,
    work_dir: &Path,
    project_dir: &Path,
) -> Result<(), PhaseFailure> {
    let spec = ServerSpec {
        project_dir: project_dir.to_path_buf(),
        data_dir: work_dir.join(SERVER_DATA_DIR),
        host: ctx.config.server_host.clone(),
        port: ctx.config.port,
        log_path: work_dir.join(SERVER_LOG),
    };
    let probe = backends
        .launcher
        .health_probe(&spec, ctx.config.health.probe_timeout())
        .map_err(PhaseFailure::setup)?;
    let server = backends
        .launcher
        .launch(&spec)
        .map_err(PhaseFailure::setup)?;
    let pid = server.pid();
    scope.adopt_server(server);
    ctx.server = Some(ServerInfo {
        pid,
        address: spec.address(),
        log_path: spec.log_path.clone(),
        data_dir: spec.data_dir.clone(),
    });
    info!(pid, address = %spec.address(), "tracking server started");

    let health = &ctx.config.health;
    let outcome = scope
        .with_server(|server| {
            wait_until_healthy(server, probe.as_ref(), health.max_attempts, health.interval())
        })
        .ok_or_else(|| PhaseFailure::Setup("tracking server handle was released".to_string()))?;

    match outcome {
        HealthOutcome::Ready { probes } => {
            info!(probes, "tracking server healthy");
            Ok(())
        }
        HealthOutcome::Crashed { probes, log_tail } => Err(PhaseFailure::Setup(format!(
            "tracking server exited after {probes} health checks; log tail:\n{log_tail}"
        ))),
        HealthOutcome::Unresponsive { probes, log_tail } => Err(PhaseFailure::Setup(format!(
            "tracking server not healthy after {probes} health checks; log tail:\n{log_tail}"
        ))),
    }
}

#[instrument(skip_all, fields(phase = "smoke_test"))]
pub fn smoke_test(ctx: &RunContext, backends: &Backends) -> Result<(), PhaseFailure> {
    let (work_dir, project_dir, env) = resolved(ctx).map_err(PhaseFailure::SmokeTest)?;
    let log_path = work_dir.join(SMOKE_LOG);
    let request = AgentRequest {
        workdir: project_dir,
        prompt: ctx.config.agent.smoke_prompt.clone(),
        allowed_tools: Vec::new(),
        skip_permissions: false,
        timeout: ctx.config.smoke_timeout(),
        log_path: log_path.clone(),
        env,
    };

    info!(timeout_secs = ctx.config.smoke_timeout_secs, "running agent smoke test");
    let outcome = backends
        .agent
        .invoke(&request)
        .map_err(|err| PhaseFailure::SmokeTest(format!("could not start agent: {err:#}")))?;
    let output = read_tail(&log_path, SMOKE_OUTPUT_BYTES).map_err(|err| {
        PhaseFailure::SmokeTest(format!("could not read agent output: {err:#}"))
    })?;

    match assess(outcome.exit_code, outcome.timed_out, &output) {
        SmokeVerdict::Responsive { excerpt } => {
            info!(response = %excerpt, "agent responded");
            Ok(())
        }
        SmokeVerdict::Unresponsive { reason } => Err(PhaseFailure::SmokeTest(reason)),
    }
}

#[instrument(skip_all, fields(phase = "execution"))]
pub fn execute(
    ctx: &mut RunContext,
    backends: &Backends,
    scope: &CleanupScope,
) -> Result<(), PhaseFailure> {
    let (work_dir, project_dir, env) = resolved(ctx).map_err(PhaseFailure::Execution)?;
    let log_path = work_dir.join(EXECUTION_LOG);
    ctx.log_file = Some(log_path.clone());
    scope.record_summary(RunSummary {
        log_file: Some(log_path.clone()),
        tracking_uri: Some(env.tracking_uri.clone()),
        experiment_id: env.experiment_id.clone(),
        server_data_dir: ctx.server.as_ref().map(|server| server.data_dir.clone()),
    });

    let request = AgentRequest {
        workdir: project_dir,
        prompt: evaluation_prompt(&ctx.config.agent.base_prompt, &ctx.extra_prompt),
        allowed_tools: ctx.config.agent.allowed_tools.clone(),
        skip_permissions: true,
        timeout: ctx.config.execution_timeout(),
        log_path: log_path.clone(),
        env,
    };

    info!(
        timeout_secs = ctx.config.execution_timeout_secs,
        log = %log_path.display(),
        "running evaluation"
    );
    let outcome = backends
        .agent
        .invoke(&request)
        .map_err(|err| PhaseFailure::Execution(format!("could not start agent: {err:#}")))?;

    if outcome.succeeded() {
        info!(duration_secs = outcome.duration.as_secs(), "evaluation finished");
        return Ok(());
    }
    if outcome.timed_out {
        return match ctx.config.timeout_policy {
            TimeoutPolicy::Proceed => {
                warn!(
                    timeout_secs = ctx.config.execution_timeout_secs,
                    "evaluation timed out; checking for artifacts anyway"
                );
                Ok(())
            }
            TimeoutPolicy::Fail => Err(PhaseFailure::Execution(format!(
                "evaluation timed out after {}s; see {}",
                ctx.config.execution_timeout_secs,
                log_path.display()
            ))),
        };
    }
    Err(PhaseFailure::Execution(format!(
        "agent exited with {}; see {}",
        outcome
            .exit_code
            .map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
        log_path.display()
    )))
}

#[instrument(skip_all, fields(phase = "verification"))]
pub fn verify_artifacts(
    ctx: &mut RunContext,
    backends: &Backends,
) -> Result<VerificationReport, PhaseFailure> {
    let (work_dir, project_dir, env) = resolved(ctx).map_err(PhaseFailure::Verification)?;
    let experiment_id = env
        .experiment_id
        .clone()
        .ok_or_else(|| PhaseFailure::Verification("no experiment was created".to_string()))?;

    info!(experiment_id = %experiment_id, "verifying artifacts");
    let report = verify_with_retry(
        backends.store.as_ref(),
        &project_dir,
        &env,
        &experiment_id,
        &ctx.config.verification,
    );

    let report_path = work_dir.join(REPORT_FILE);
    if let Err(err) = write_json(&report_path, &report) {
        warn!(err = %format!("{err:#}"), "could not write verification report");
    }
    for line in report.render_lines() {
        info!("{line}");
    }
    ctx.report = Some(report.clone());

    if report.overall_pass {
        return Ok(report);
    }
    let missing: Vec<String> = report.missing().iter().map(|kind| kind.to_string()).collect();
    Err(PhaseFailure::Verification(format!(
        "missing {}",
        missing.join(", ")
    )))
}

/// Values later phases need from Setup.
fn resolved(ctx: &RunContext) -> Result<(PathBuf, PathBuf, TrackingEnv), String> {
    match (&ctx.work_dir, &ctx.project_dir, &ctx.tracking_env) {
        (Some(work_dir), Some(project_dir), Some(env)) => {
            Ok((work_dir.clone(), project_dir.clone(), env.clone()))
        }
        _ => Err("setup did not complete".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FakeLauncher, FakeSource, FakeStore, RecordingPackages, ScriptedAgent, ScriptedRun,
        TestRun,
    };
    use std::fs;

    struct Harness {
        ctx: RunContext,
        backends: Backends,
        scope: CleanupScope,
        source: FakeSource,
        launcher: FakeLauncher,
        store: FakeStore,
        agent: ScriptedAgent,
        packages: RecordingPackages,
        _run: TestRun,
    }

    fn harness(agent: ScriptedAgent, store: FakeStore, uri: Option<&str>) -> Harness {
        harness_with(agent, store, uri, RecordingPackages::default())
    }

    fn harness_with(
        agent: ScriptedAgent,
        store: FakeStore,
        uri: Option<&str>,
        packages: RecordingPackages,
    ) -> Harness {
        let run = TestRun::new().expect("test run");
        let scope = CleanupScope::new(run.config.shutdown.clone(), true);
        let ctx = run.context(uri);
        let launcher = FakeLauncher::healthy();
        let source = FakeSource::default();
        let backends = Backends {
            source: Box::new(source.clone()),
            packages: Box::new(packages.clone()),
            launcher: Box::new(launcher.clone()),
            store: Box::new(store.clone()),
            agent: Box::new(agent.clone()),
        };
        Harness {
            ctx,
            backends,
            scope,
            source,
            launcher,
            store,
            agent,
            packages,
            _run: run,
        }
    }

    #[test]
    fn missing_skill_marker_is_a_prerequisite_failure() {
        let mut h = harness(ScriptedAgent::new([]), FakeStore::with_counts(1, 1, 1), None);
        fs::remove_file(h.ctx.skill_dir.join("SKILL.md")).expect("remove");

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(matches!(err, PhaseFailure::PrerequisiteUnmet(ref msg) if msg.contains("SKILL.md")));
        assert_eq!(h.source.fetches(), 0);
        assert!(h.ctx.work_dir.is_none());
    }

    #[test]
    fn missing_tool_is_reported_by_name() {
        let mut h = harness(ScriptedAgent::new([]), FakeStore::with_counts(1, 1, 1), None);
        h.ctx.config.required_tools.push("missing-tool-91x".to_string());

        let err = check_prerequisites(&mut h.ctx, &h.scope).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("missing-tool-91x"));
    }

    #[test]
    fn occupied_port_fails_without_external_endpoint() {
        let mut h = harness(ScriptedAgent::new([]), FakeStore::with_counts(1, 1, 1), None);
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        h.ctx.config.port = listener.local_addr().expect("addr").port();

        let err = check_prerequisites(&mut h.ctx, &h.scope).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn external_endpoint_skips_port_check() {
        let mut h = harness(
            ScriptedAgent::new([]),
            FakeStore::with_counts(1, 1, 1),
            Some("http://tracking.example:5000"),
        );
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        h.ctx.config.port = listener.local_addr().expect("addr").port();

        check_prerequisites(&mut h.ctx, &h.scope).expect("prerequisites");
        assert!(h.ctx.using_external_endpoint);
    }

    #[test]
    fn successful_run_threads_tracking_env_to_children() {
        let mut h = harness(
            ScriptedAgent::healthy_then_exits(0),
            FakeStore::with_counts(1, 2, 3),
            None,
        );

        let report = run_pipeline(&mut h.ctx, &h.backends, &h.scope).expect("pass");
        assert!(report.overall_pass);

        assert_eq!(h.source.fetches(), 1);
        let address = h.ctx.server.as_ref().expect("server").address.clone();
        let requests = h.agent.requests();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            assert_eq!(request.env.tracking_uri, address);
            assert_eq!(request.env.experiment_id.as_deref(), Some("E"));
            assert_eq!(request.env.openai_api_key.as_deref(), Some("sk-test"));
        }
        assert!(requests[0].allowed_tools.is_empty());
        assert!(!requests[0].skip_permissions);
        assert!(requests[1].skip_permissions);
        assert!(requests[1].prompt.ends_with("focus on latency"));

        let created = h.store.created();
        assert_eq!(created.len(), 1);
        assert!(created[0].0.starts_with("agent-eval-test-"));
        assert_eq!(created[0].1.experiment_id, None);
        assert!(
            h.store
                .count_envs()
                .iter()
                .all(|env| env.experiment_id.as_deref() == Some("E"))
        );

        let work_dir = h.ctx.work_dir.clone().expect("work dir");
        assert!(work_dir.join("verification.json").is_file());
        assert!(work_dir.join("mlflow-agent/.claude/skills/agent-evaluation/SKILL.md").is_file());
        assert_eq!(h.packages.calls(), vec!["sync", "add mlflow"]);
    }

    #[test]
    fn unhealthy_server_fails_setup_and_is_still_adopted() {
        let mut h = harness(ScriptedAgent::new([]), FakeStore::with_counts(1, 1, 1), None);
        let launcher = FakeLauncher::unhealthy();
        h.backends.launcher = Box::new(launcher.clone());

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(matches!(err, PhaseFailure::Setup(ref msg) if msg.contains("not healthy after 3")));

        h.scope.run().expect("cleanup");
        assert_eq!(launcher.terminations(), 1);
    }

    #[test]
    fn smoke_output_with_error_stops_before_execution() {
        let agent = ScriptedAgent::new([ScriptedRun::exits(0, "Error: not logged in")]);
        let mut h = harness(agent, FakeStore::with_counts(1, 1, 1), None);

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(matches!(err, PhaseFailure::SmokeTest(_)));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(h.agent.requests().len(), 1);
    }

    #[test]
    fn unreadable_smoke_output_names_the_read_error() {
        let agent = ScriptedAgent::new([ScriptedRun::without_log(0)]);
        let mut h = harness(agent, FakeStore::with_counts(1, 1, 1), None);

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(
            matches!(err, PhaseFailure::SmokeTest(ref msg) if msg.contains("could not read agent output") && msg.contains("smoke_test.log")),
            "unexpected failure: {err:?}"
        );
        assert_eq!(h.agent.requests().len(), 1);
    }

    #[test]
    fn kept_run_reports_local_server_data_dir() {
        let mut h = harness(
            ScriptedAgent::healthy_then_exits(0),
            FakeStore::with_counts(1, 1, 1),
            None,
        );

        run_pipeline(&mut h.ctx, &h.backends, &h.scope).expect("pass");
        let report = h.scope.run().expect("cleanup");

        let work_dir = h.ctx.work_dir.clone().expect("work dir");
        assert_eq!(report.server_data_dir, Some(work_dir.join("mlflow-data")));
    }

    #[test]
    fn unstartable_agent_fails_smoke_test() {
        let agent = ScriptedAgent::new([ScriptedRun::unstartable()]);
        let mut h = harness(agent, FakeStore::with_counts(1, 1, 1), None);

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(matches!(err, PhaseFailure::SmokeTest(ref msg) if msg.contains("could not start")));
    }

    #[test]
    fn timeout_proceeds_to_verification_by_default() {
        let agent = ScriptedAgent::new([
            ScriptedRun::exits(0, "hello"),
            ScriptedRun::times_out("partial transcript"),
        ]);
        let mut h = harness(agent, FakeStore::with_counts(1, 1, 1), None);

        let report = run_pipeline(&mut h.ctx, &h.backends, &h.scope).expect("pass");
        assert!(report.overall_pass);
        assert_eq!(h.store.count_calls(), 3);
    }

    #[test]
    fn timeout_fails_execution_under_fail_policy() {
        let agent = ScriptedAgent::new([
            ScriptedRun::exits(0, "hello"),
            ScriptedRun::times_out("partial transcript"),
        ]);
        let mut h = harness(agent, FakeStore::with_counts(1, 1, 1), None);
        h.ctx.config.timeout_policy = TimeoutPolicy::Fail;

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(matches!(err, PhaseFailure::Execution(ref msg) if msg.contains("timed out")));
        assert_eq!(h.store.count_calls(), 0);
    }

    #[test]
    fn missing_artifacts_fail_verification_with_report() {
        let mut h = harness(
            ScriptedAgent::healthy_then_exits(0),
            FakeStore::with_counts(2, 0, 1),
            None,
        );

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert_eq!(err, PhaseFailure::Verification("missing scorers".to_string()));
        assert_eq!(err.exit_code(), 3);
        let report = h.ctx.report.as_ref().expect("report kept");
        assert!(report.datasets.pass);
        assert!(!report.scorers.pass);
    }

    #[test]
    fn databricks_uri_nests_experiment_under_user() {
        let packages = RecordingPackages::failing_on("databricks-agents");
        let mut h = harness_with(
            ScriptedAgent::healthy_then_exits(0),
            FakeStore::with_counts(1, 1, 1).with_workspace_user("me@example.com"),
            Some("databricks://dev"),
            packages,
        );

        run_pipeline(&mut h.ctx, &h.backends, &h.scope).expect("pass");

        assert_eq!(h.launcher.launches(), 0);
        assert!(
            h.ctx
                .experiment_name
                .as_deref()
                .expect("name")
                .starts_with("/Users/me@example.com/agent-eval-test-")
        );
        assert_eq!(
            h.packages.calls(),
            vec![
                "sync",
                "add mlflow",
                "add databricks-agents databricks-connect"
            ]
        );
    }

    #[test]
    fn databricks_uri_without_user_fails_setup() {
        let mut h = harness(
            ScriptedAgent::new([]),
            FakeStore::with_counts(1, 1, 1),
            Some("databricks://dev"),
        );

        let err = run_pipeline(&mut h.ctx, &h.backends, &h.scope).unwrap_err();
        assert!(matches!(err, PhaseFailure::Setup(ref msg) if msg.contains("profile dev")));
        assert!(h.store.created().is_empty());
    }
}
