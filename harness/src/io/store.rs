//! Tracking store adapter.
//!
//! Queries run inside the project's Python environment (`uv run`) so they
//! work for every tracking URI scheme the MLflow client understands,
//! including `databricks://` profiles that have no plain HTTP surface.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::report::ArtifactKind;
use crate::io::process::run_captured;
use crate::io::tracking_env::TrackingEnv;

const OUTPUT_LIMIT_BYTES: usize = 256 * 1024;

const CREATE_EXPERIMENT_PY: &str = "import sys, mlflow\nprint(mlflow.create_experiment(sys.argv[1]))\n";
const COUNT_DATASETS_PY: &str = "import sys\nfrom mlflow import MlflowClient\nprint(len(MlflowClient().search_datasets(experiment_ids=[sys.argv[1]])))\n";
const COUNT_TRACES_PY: &str = "import sys\nfrom mlflow import MlflowClient\nprint(len(MlflowClient().search_traces(experiment_ids=[sys.argv[1]])))\n";

/// Operations the harness needs from the external tracking store.
pub trait TrackingStore {
    /// Create an experiment and return its identifier.
    fn create_experiment(&self, project_dir: &Path, env: &TrackingEnv, name: &str)
    -> Result<String>;

    /// Number of artifacts of `kind` recorded under `experiment_id`.
    fn count(
        &self,
        project_dir: &Path,
        env: &TrackingEnv,
        experiment_id: &str,
        kind: ArtifactKind,
    ) -> Result<usize>;

    /// Workspace user name for a Databricks CLI profile.
    fn workspace_user(&self, profile: &str) -> Result<String>;
}

/// Store backed by the MLflow Python client and CLI.
pub struct MlflowStore {
    timeout: Duration,
}

impl MlflowStore {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn python(&self, project_dir: &Path, env: &TrackingEnv, code: &str, arg: &str) -> Result<String> {
        let mut cmd = Command::new("uv");
        cmd.args(["run", "python", "-c", code, arg])
            .current_dir(project_dir);
        env.apply(&mut cmd);
        let output = run_captured(cmd, self.timeout, OUTPUT_LIMIT_BYTES)?;
        output.ensure_success("mlflow python client")?;
        Ok(output.stdout_text())
    }
}

impl TrackingStore for MlflowStore {
    #[instrument(skip_all, fields(name = %name))]
    fn create_experiment(
        &self,
        project_dir: &Path,
        env: &TrackingEnv,
        name: &str,
    ) -> Result<String> {
        let stdout = self
            .python(project_dir, env, CREATE_EXPERIMENT_PY, name)
            .context("create experiment")?;
        parse_experiment_id(&stdout)
    }

    #[instrument(skip_all, fields(experiment_id = %experiment_id, kind = %kind))]
    fn count(
        &self,
        project_dir: &Path,
        env: &TrackingEnv,
        experiment_id: &str,
        kind: ArtifactKind,
    ) -> Result<usize> {
        let count = match kind {
            ArtifactKind::Datasets => {
                let stdout = self.python(project_dir, env, COUNT_DATASETS_PY, experiment_id)?;
                parse_count(&stdout)?
            }
            ArtifactKind::Traces => {
                let stdout = self.python(project_dir, env, COUNT_TRACES_PY, experiment_id)?;
                parse_count(&stdout)?
            }
            ArtifactKind::Scorers => {
                let mut cmd = Command::new("uv");
                cmd.args(["run", "python", "-m", "mlflow", "scorers", "list", "-x"])
                    .arg(experiment_id)
                    .current_dir(project_dir);
                env.apply(&mut cmd);
                let output = run_captured(cmd, self.timeout, OUTPUT_LIMIT_BYTES)?;
                output.ensure_success("mlflow scorers list")?;
                count_scorer_rows(&output.stdout_text())
            }
        };
        debug!(count, "store query finished");
        Ok(count)
    }

    #[instrument(skip_all, fields(profile = %profile))]
    fn workspace_user(&self, profile: &str) -> Result<String> {
        let mut cmd = Command::new("databricks");
        cmd.args(["current-user", "me", "-p", profile]);
        let output = run_captured(cmd, self.timeout, OUTPUT_LIMIT_BYTES)?;
        output.ensure_success("databricks current-user me")?;
        parse_user_name(&output.stdout_text())
    }
}

/// Experiment id printed on the last non-empty line by the create snippet.
pub fn parse_experiment_id(stdout: &str) -> Result<String> {
    let id = last_line(stdout).ok_or_else(|| anyhow!("create experiment printed nothing"))?;
    if id.contains("Error") || id.contains("Traceback") {
        bail!("create experiment reported an error: {id}");
    }
    Ok(id.to_string())
}

fn parse_count(stdout: &str) -> Result<usize> {
    let line = last_line(stdout).ok_or_else(|| anyhow!("store query printed nothing"))?;
    line.parse::<usize>()
        .with_context(|| format!("parse count from {line:?}"))
}

/// Count data rows in `mlflow scorers list` table output.
///
/// Header rows (containing `Name`) and `---` separators are not scorers.
pub fn count_scorer_rows(stdout: &str) -> usize {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("---") && !line.contains("Name"))
        .count()
}

#[derive(Deserialize)]
struct CurrentUser {
    #[serde(rename = "userName", default)]
    user_name: String,
}

fn parse_user_name(stdout: &str) -> Result<String> {
    let user: CurrentUser =
        serde_json::from_str(stdout.trim()).context("parse databricks current-user output")?;
    if user.user_name.trim().is_empty() {
        bail!("databricks current-user returned no userName");
    }
    Ok(user.user_name)
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).rfind(|line| !line.is_empty())
}
