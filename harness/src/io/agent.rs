//! Agent runtime abstraction.
//!
//! The [`AgentRuntime`] trait decouples the pipeline from the actual agent
//! backend (currently the `claude` CLI in headless mode). Tests use scripted
//! runtimes that return predetermined outcomes without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::naming::session_dir_name;
use crate::io::process::{ForegroundChild, InvocationOutcome, run_logged};
use crate::io::tracking_env::TrackingEnv;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process (the project checkout).
    pub workdir: PathBuf,
    pub prompt: String,
    /// Tools the agent may use; empty grants none.
    pub allowed_tools: Vec<String>,
    /// Run without interactive permission prompts.
    pub skip_permissions: bool,
    pub timeout: Duration,
    /// Combined stdout/stderr destination.
    pub log_path: PathBuf,
    pub env: TrackingEnv,
}

/// Abstraction over agent runtimes.
pub trait AgentRuntime {
    /// Run the agent once. Non-zero exit and timeout are outcomes, not errors.
    fn invoke(&self, request: &AgentRequest) -> Result<InvocationOutcome>;

    /// Where the runtime keeps session logs for `project_dir`, if known.
    fn session_log_dir(&self, project_dir: &Path) -> Option<PathBuf>;
}

/// Runtime that spawns the `claude` CLI with `-p`.
pub struct ClaudeCli {
    command: String,
    foreground: Option<ForegroundChild>,
}

impl ClaudeCli {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            foreground: None,
        }
    }

    /// Publish each running invocation's pid in `foreground`.
    pub fn with_foreground(mut self, foreground: ForegroundChild) -> Self {
        self.foreground = Some(foreground);
        self
    }
}

impl AgentRuntime for ClaudeCli {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), log = %request.log_path.display()))]
    fn invoke(&self, request: &AgentRequest) -> Result<InvocationOutcome> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let mut cmd = Command::new(&self.command);
        cmd.args(cli_args(request)).current_dir(&request.workdir);
        request.env.apply(&mut cmd);
        run_logged(
            cmd,
            request.timeout,
            &request.log_path,
            self.foreground.as_ref(),
        )
    }

    fn session_log_dir(&self, project_dir: &Path) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(
            home.join(".claude")
                .join("projects")
                .join(session_dir_name(project_dir)),
        )
    }
}

/// Arguments for a headless invocation.
pub fn cli_args(request: &AgentRequest) -> Vec<String> {
    let mut args = vec!["-p".to_string(), request.prompt.clone()];
    if request.skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }
    args.push("--allowedTools".to_string());
    args.push(request.allowed_tools.join(","));
    args
}
