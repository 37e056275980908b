//! Mutable record of one run, threaded through every phase.

use std::path::{Path, PathBuf};

use crate::config::HarnessConfig;
use crate::core::report::VerificationReport;
use crate::io::tracking_env::TrackingEnv;

const DEFAULT_RUNS_DIR: &str = "test-runs";

/// Descriptive record of the server this run started. The process handle
/// itself belongs to the cleanup scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub pid: u32,
    pub address: String,
    pub log_path: PathBuf,
    /// Backend store and artifact root.
    pub data_dir: PathBuf,
}

#[derive(Debug)]
pub struct RunContext {
    pub config: HarnessConfig,
    pub skill_dir: PathBuf,
    /// Appended to the evaluation prompt; may be empty.
    pub extra_prompt: String,
    /// Pre-configured tracking endpoint. When set, no local server is started.
    pub external_tracking_uri: Option<String>,
    pub openai_api_key: Option<String>,

    pub work_dir: Option<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub experiment_id: Option<String>,
    pub experiment_name: Option<String>,
    /// Combined output of the evaluation invocation.
    pub log_file: Option<PathBuf>,
    pub using_external_endpoint: bool,
    pub server: Option<ServerInfo>,
    /// Environment handed to agent and store children once Setup resolved it.
    pub tracking_env: Option<TrackingEnv>,
    pub report: Option<VerificationReport>,
}

impl RunContext {
    pub fn new(
        config: HarnessConfig,
        skill_dir: PathBuf,
        extra_prompt: String,
        external_tracking_uri: Option<String>,
        openai_api_key: Option<String>,
    ) -> Self {
        Self {
            config,
            skill_dir,
            extra_prompt,
            external_tracking_uri: external_tracking_uri.filter(|uri| !uri.trim().is_empty()),
            openai_api_key: openai_api_key.filter(|key| !key.is_empty()),
            work_dir: None,
            project_dir: None,
            experiment_id: None,
            experiment_name: None,
            log_file: None,
            using_external_endpoint: false,
            server: None,
            tracking_env: None,
            report: None,
        }
    }

    /// Parent of working directories: the configured one, else a sibling of
    /// the skill directory.
    pub fn runs_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config.runs_dir {
            return dir.clone();
        }
        self.skill_dir
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DEFAULT_RUNS_DIR)
    }

    /// Tracking URI in effect: the external one, or the local server address.
    pub fn tracking_uri(&self) -> Option<&str> {
        self.external_tracking_uri
            .as_deref()
            .or_else(|| self.server.as_ref().map(|server| server.address.as_str()))
    }
}
