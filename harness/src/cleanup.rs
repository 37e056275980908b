//! Exactly-once, best-effort teardown of everything a run created.
//!
//! Resources are registered with a [`CleanupScope`] as soon as they exist.
//! The scope is shared between the [`CleanupGuard`] wrapping the pipeline and
//! the interrupt handler; whichever reaches [`CleanupScope::run`] first does
//! the work and every later call is a no-op. No step can fail the run: errors
//! are logged as warnings.
//!
//! Teardown order: the agent still running in the foreground, session logs,
//! the tracking server, then the working directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::config::ShutdownConfig;
use crate::io::process::ForegroundChild;
use crate::io::server::{SupervisedServer, TerminateOutcome};
use crate::io::workspace::copy_tree;

const SESSIONS_DIR: &str = "claude-sessions";

/// Facts printed when the working directory is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub log_file: Option<PathBuf>,
    pub tracking_uri: Option<String>,
    pub experiment_id: Option<String>,
    /// Backend store and artifacts of the local tracking server.
    pub server_data_dir: Option<PathBuf>,
}

/// What the single cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// `None` when no agent invocation was in flight.
    pub foreground: Option<TerminateOutcome>,
    /// `None` when no server was owned by this run.
    pub server: Option<TerminateOutcome>,
    pub sessions_copied: Option<usize>,
    pub work_dir_removed: bool,
    pub kept_work_dir: Option<PathBuf>,
    /// Local server data left in the kept working directory.
    pub server_data_dir: Option<PathBuf>,
}

struct CleanupState {
    done: bool,
    interrupted: bool,
    shutdown: ShutdownConfig,
    keep_work_dir: bool,
    work_dir: Option<PathBuf>,
    server: Option<Box<dyn SupervisedServer>>,
    external_endpoint: bool,
    session_source: Option<PathBuf>,
    summary: RunSummary,
}

#[derive(Clone)]
pub struct CleanupScope {
    state: Arc<Mutex<CleanupState>>,
    // Outside the state lock: the waiting thread clears it while `run` holds the lock.
    foreground: ForegroundChild,
}

impl CleanupScope {
    pub fn new(shutdown: ShutdownConfig, keep_work_dir: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(CleanupState {
                done: false,
                interrupted: false,
                shutdown,
                keep_work_dir,
                work_dir: None,
                server: None,
                external_endpoint: false,
                session_source: None,
                summary: RunSummary::default(),
            })),
            foreground: ForegroundChild::new(),
        }
    }

    // A panic elsewhere must not prevent teardown.
    fn lock(&self) -> MutexGuard<'_, CleanupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slot the agent runtime publishes its running invocation in.
    pub fn foreground(&self) -> ForegroundChild {
        self.foreground.clone()
    }

    pub fn register_work_dir(&self, path: &Path) {
        self.lock().work_dir = Some(path.to_path_buf());
    }

    /// Take ownership of the server this run started.
    pub fn adopt_server(&self, server: Box<dyn SupervisedServer>) {
        self.lock().server = Some(server);
    }

    /// Run `f` against the adopted server, if any.
    ///
    /// The scope stays locked while `f` runs, so an interrupt arriving
    /// meanwhile tears down only after `f` returns.
    pub fn with_server<T>(&self, f: impl FnOnce(&mut dyn SupervisedServer) -> T) -> Option<T> {
        let mut state = self.lock();
        state.server.as_mut().map(|server| f(server.as_mut()))
    }

    /// The tracking endpoint belongs to someone else; never terminate anything.
    pub fn mark_external_endpoint(&self) {
        self.lock().external_endpoint = true;
    }

    /// Directory whose contents are copied into the kept working directory.
    pub fn set_session_source(&self, path: Option<PathBuf>) {
        self.lock().session_source = path;
    }

    pub fn record_summary(&self, summary: RunSummary) {
        self.lock().summary = summary;
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Whether cleanup was triggered by a signal rather than the pipeline.
    pub fn was_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    /// Cleanup on SIGINT/SIGTERM. The run is reported as interrupted even when
    /// the pipeline finishes first.
    pub fn interrupt(&self) -> Option<CleanupReport> {
        self.lock().interrupted = true;
        self.run()
    }

    /// Tear down registered resources. Returns `None` if cleanup already ran.
    #[instrument(skip_all)]
    pub fn run(&self) -> Option<CleanupReport> {
        let mut state = self.lock();
        if state.done {
            debug!("cleanup already ran");
            return None;
        }
        state.done = true;
        info!("cleaning up");

        let mut report = CleanupReport::default();

        if let Some(outcome) = self.foreground.terminate(&state.shutdown) {
            match outcome {
                TerminateOutcome::Stopped => info!("stopped running agent"),
                TerminateOutcome::AlreadyGone => debug!("agent already exited"),
                TerminateOutcome::StillRunning => warn!("agent did not exit; continuing"),
            }
            report.foreground = Some(outcome);
        }

        if state.keep_work_dir {
            if let (Some(work_dir), Some(source)) = (&state.work_dir, &state.session_source) {
                report.sessions_copied = copy_sessions(source, work_dir);
            }
        }

        if state.external_endpoint {
            debug!("external tracking endpoint; nothing to terminate");
        } else if let Some(mut server) = state.server.take() {
            let shutdown = state.shutdown.clone();
            let pid = server.pid();
            let outcome = server.terminate(&shutdown);
            match outcome {
                TerminateOutcome::Stopped => info!(pid, "tracking server stopped"),
                TerminateOutcome::AlreadyGone => info!(pid, "tracking server already exited"),
                TerminateOutcome::StillRunning => {
                    warn!(pid, "tracking server did not exit; continuing");
                }
            }
            report.server = Some(outcome);
        }

        if let Some(work_dir) = state.work_dir.clone() {
            if state.keep_work_dir {
                if report.server.is_some() {
                    report.server_data_dir = state.summary.server_data_dir.clone();
                }
                log_kept_summary(&work_dir, &state.summary, &report);
                report.kept_work_dir = Some(work_dir);
            } else {
                match fs::remove_dir_all(&work_dir) {
                    Ok(()) => {
                        info!(work_dir = %work_dir.display(), "removed working directory");
                        report.work_dir_removed = true;
                    }
                    Err(err) => {
                        warn!(work_dir = %work_dir.display(), err = %err, "failed to remove working directory");
                    }
                }
            }
        }

        Some(report)
    }
}

fn copy_sessions(source: &Path, work_dir: &Path) -> Option<usize> {
    if !source.is_dir() {
        debug!(source = %source.display(), "no agent session logs found");
        return None;
    }
    let dest = work_dir.join(SESSIONS_DIR);
    match copy_tree(source, &dest) {
        Ok(files) => {
            debug!(files, dest = %dest.display(), "copied agent session logs");
            Some(files)
        }
        Err(err) => {
            warn!(err = %format!("{err:#}"), "failed to copy agent session logs");
            None
        }
    }
}

fn log_kept_summary(work_dir: &Path, summary: &RunSummary, report: &CleanupReport) {
    info!(work_dir = %work_dir.display(), "working directory kept");
    if let Some(log_file) = &summary.log_file {
        info!(path = %log_file.display(), "agent output log");
    }
    if report.sessions_copied.is_some() {
        info!(path = %work_dir.join(SESSIONS_DIR).display(), "agent session logs");
    }
    if let Some(data_dir) = &report.server_data_dir {
        info!(path = %data_dir.display(), "tracking server data");
    }
    if let Some(uri) = &summary.tracking_uri {
        info!(tracking_uri = %uri, experiment_id = ?summary.experiment_id, "tracking location");
    }
}

/// Runs the shared scope's cleanup when dropped.
pub struct CleanupGuard {
    scope: CleanupScope,
}

impl CleanupGuard {
    pub fn new(scope: CleanupScope) -> Self {
        Self { scope }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.scope.run();
    }
}
