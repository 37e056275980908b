//! Whole-run scenarios driven through the public pipeline with scripted
//! collaborators.
//!
//! Each test wraps the run in a `CleanupGuard` exactly like the binary does,
//! then checks the verdict, the exit code, and what cleanup did to the
//! server and the working directory.

use std::fs;

use harness::cleanup::{CleanupGuard, CleanupScope};
use harness::core::report::VerificationReport;
use harness::exit_codes;
use harness::failure::PhaseFailure;
use harness::pipeline::{Backends, run_pipeline};
use harness::test_support::{
    FakeLauncher, FakeSource, FakeStore, RecordingPackages, ScriptedAgent, TestRun,
};

fn backends(launcher: &FakeLauncher, store: &FakeStore, agent: &ScriptedAgent) -> Backends {
    Backends {
        source: Box::new(FakeSource::default()),
        packages: Box::new(RecordingPackages::default()),
        launcher: Box::new(launcher.clone()),
        store: Box::new(store.clone()),
        agent: Box::new(agent.clone()),
    }
}

fn exit_code(outcome: &Result<VerificationReport, PhaseFailure>) -> i32 {
    match outcome {
        Ok(_) => exit_codes::OK,
        Err(failure) => failure.exit_code(),
    }
}

#[test]
fn passing_run_exits_zero_and_stops_server() {
    let run = TestRun::new().expect("test run");
    let mut ctx = run.context(None);
    let launcher = FakeLauncher::healthy();
    let store = FakeStore::with_counts(1, 1, 1);
    let agent = ScriptedAgent::healthy_then_exits(0);
    let backends = backends(&launcher, &store, &agent);
    let scope = CleanupScope::new(ctx.config.shutdown.clone(), true);

    let outcome = {
        let _guard = CleanupGuard::new(scope.clone());
        run_pipeline(&mut ctx, &backends, &scope)
    };

    assert_eq!(exit_code(&outcome), exit_codes::OK);
    assert_eq!(ctx.experiment_id.as_deref(), Some("E"));
    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.terminations(), 1);
    assert!(scope.is_done());

    let work_dir = ctx.work_dir.expect("work dir");
    let persisted: VerificationReport = serde_json::from_str(
        &fs::read_to_string(work_dir.join("verification.json")).expect("read report"),
    )
    .expect("parse report");
    assert!(persisted.overall_pass);
    assert_eq!(
        fs::read_to_string(work_dir.join("claude_output.log")).expect("read log"),
        "evaluation transcript"
    );
}

#[test]
fn failed_execution_skips_verification_and_still_stops_server() {
    let run = TestRun::new().expect("test run");
    let mut ctx = run.context(None);
    let launcher = FakeLauncher::healthy();
    let store = FakeStore::with_counts(1, 1, 1);
    let agent = ScriptedAgent::healthy_then_exits(1);
    let backends = backends(&launcher, &store, &agent);
    let scope = CleanupScope::new(ctx.config.shutdown.clone(), true);

    let outcome = {
        let _guard = CleanupGuard::new(scope.clone());
        run_pipeline(&mut ctx, &backends, &scope)
    };

    assert_eq!(exit_code(&outcome), exit_codes::EXECUTION_FAILED);
    assert_eq!(store.count_calls(), 0);
    assert!(ctx.report.is_none());
    assert_eq!(launcher.terminations(), 1);
}

#[test]
fn external_endpoint_is_left_running() {
    let run = TestRun::new().expect("test run");
    let mut ctx = run.context(Some("http://tracking.example:5000"));
    let launcher = FakeLauncher::healthy();
    let store = FakeStore::with_counts(1, 1, 1);
    let agent = ScriptedAgent::healthy_then_exits(0);
    let backends = backends(&launcher, &store, &agent);
    let scope = CleanupScope::new(ctx.config.shutdown.clone(), true);

    let outcome = {
        let _guard = CleanupGuard::new(scope.clone());
        run_pipeline(&mut ctx, &backends, &scope)
    };

    assert_eq!(exit_code(&outcome), exit_codes::OK);
    assert!(ctx.using_external_endpoint);
    assert!(ctx.server.is_none());
    assert_eq!(launcher.launches(), 0);
    assert_eq!(launcher.terminations(), 0);
    for request in agent.requests() {
        assert_eq!(request.env.tracking_uri, "http://tracking.example:5000");
    }
}

#[test]
fn missing_artifacts_exit_three_and_remove_workdir_when_not_kept() {
    let run = TestRun::new().expect("test run");
    let mut ctx = run.context(None);
    let launcher = FakeLauncher::healthy();
    let store = FakeStore::with_counts(0, 1, 1);
    let agent = ScriptedAgent::healthy_then_exits(0);
    let backends = backends(&launcher, &store, &agent);
    let scope = CleanupScope::new(ctx.config.shutdown.clone(), false);

    let outcome = {
        let _guard = CleanupGuard::new(scope.clone());
        run_pipeline(&mut ctx, &backends, &scope)
    };

    assert_eq!(exit_code(&outcome), exit_codes::VERIFICATION_FAILED);
    let report = ctx.report.as_ref().expect("report");
    assert!(!report.datasets.pass);
    assert!(report.scorers.pass);
    assert!(!ctx.work_dir.as_ref().expect("work dir").exists());
    assert_eq!(launcher.terminations(), 1);
}

#[test]
fn session_logs_are_copied_into_kept_workdir() {
    let run = TestRun::new().expect("test run");
    let sessions = run.path().join("sessions");
    fs::create_dir_all(&sessions).expect("mkdir");
    fs::write(sessions.join("session.jsonl"), "{}\n").expect("write");

    let mut ctx = run.context(None);
    let launcher = FakeLauncher::healthy();
    let store = FakeStore::with_counts(1, 1, 1);
    let agent = ScriptedAgent::healthy_then_exits(0).with_session_dir(sessions);
    let backends = backends(&launcher, &store, &agent);
    let scope = CleanupScope::new(ctx.config.shutdown.clone(), true);

    {
        let _guard = CleanupGuard::new(scope.clone());
        run_pipeline(&mut ctx, &backends, &scope).expect("pass");
    }

    let work_dir = ctx.work_dir.expect("work dir");
    assert!(work_dir.join("claude-sessions/session.jsonl").is_file());
}
