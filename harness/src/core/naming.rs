//! Names derived from timestamps and tracking URIs.

use std::path::Path;

pub const RUN_PREFIX: &str = "agent-eval-test";

const DATABRICKS_SCHEME: &str = "databricks://";

/// Working directory name: `agent-eval-test-<timestamp>_<short id>`.
pub fn workdir_name(timestamp: &str, short_id: &str) -> String {
    format!("{RUN_PREFIX}-{timestamp}_{short_id}")
}

/// Experiment name for a run.
///
/// Databricks workspaces require absolute user paths, so when a workspace
/// user is known the name is nested under `/Users/<user>/`.
pub fn experiment_name(timestamp: &str, workspace_user: Option<&str>) -> String {
    let base = format!("{RUN_PREFIX}-{timestamp}");
    match workspace_user {
        Some(user) => format!("/Users/{user}/{base}"),
        None => base,
    }
}

/// Databricks CLI profile named by a `databricks://<profile>` tracking URI.
///
/// An empty profile maps to `DEFAULT`.
pub fn databricks_profile(tracking_uri: &str) -> Option<&str> {
    let profile = tracking_uri.strip_prefix(DATABRICKS_SCHEME)?;
    if profile.is_empty() {
        Some("DEFAULT")
    } else {
        Some(profile)
    }
}

/// Directory name the agent runtime uses for a project's session logs.
pub fn session_dir_name(project_dir: &Path) -> String {
    project_dir.to_string_lossy().replace('/', "-")
}
