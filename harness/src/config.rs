//! Harness configuration, optionally loaded from a TOML file.
//!
//! Missing fields default to the values the harness has always used, so an
//! empty (or absent) file behaves exactly like running with no `--config`.
//! CLI flags are layered on top with [`apply_overrides`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// What to do when the evaluation invocation hits its wall-clock timeout.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Treat the timeout as inconclusive and let verification decide.
    #[default]
    Proceed,
    /// Treat the timeout as an execution failure.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Repository cloned (shallow) as the system under test.
    pub project_repo: String,

    /// Commands that must resolve on `PATH` before anything else happens.
    pub required_tools: Vec<String>,

    /// Host the local tracking server binds to.
    pub server_host: String,

    /// Port for the local tracking server.
    pub port: u16,

    /// Wall-clock budget for the evaluation invocation.
    pub execution_timeout_secs: u64,

    /// Wall-clock budget for the smoke-test invocation.
    pub smoke_timeout_secs: u64,

    /// Budget for clone and dependency installation commands.
    pub setup_command_timeout_secs: u64,

    /// Budget for each tracking store query or mutation.
    pub store_query_timeout_secs: u64,

    pub timeout_policy: TimeoutPolicy,

    /// Packages added to the project after `uv sync`.
    pub extra_packages: Vec<String>,

    /// Keep the working directory after the run.
    pub keep_workdir: bool,

    /// Parent directory for working directories. Defaults to
    /// `<skill dir>/../test-runs` when unset.
    pub runs_dir: Option<PathBuf>,

    pub health: HealthConfig,
    pub shutdown: ShutdownConfig,
    pub verification: VerificationConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    /// Per-probe HTTP timeout.
    pub probe_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 1_000,
            probe_timeout_ms: 2_000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Number of exit checks after the stop signal.
    pub checks: u32,
    pub interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            checks: 10,
            interval_ms: 500,
        }
    }
}

impl ShutdownConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Total verification attempts; `1` reads the store once.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_secs: 5,
        }
    }
}

impl VerificationConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI executable.
    pub command: String,
    /// Prompt for the evaluation invocation; the extra prompt is appended.
    pub base_prompt: String,
    /// Prompt for the smoke test.
    pub smoke_prompt: String,
    /// Tools granted during the evaluation invocation.
    pub allowed_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            base_prompt: "Evaluate the output quality of my agent. Do not ask for input.".to_string(),
            smoke_prompt: "Say hello world".to_string(),
            allowed_tools: ["Bash", "Read", "Write", "Edit", "Grep", "Glob", "WebFetch"]
                .iter()
                .map(|tool| tool.to_string())
                .collect(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            project_repo: "https://github.com/alkispoly-db/mlflow-agent".to_string(),
            required_tools: vec!["claude".to_string(), "git".to_string(), "uv".to_string()],
            server_host: "127.0.0.1".to_string(),
            port: 5000,
            execution_timeout_secs: 900,
            smoke_timeout_secs: 120,
            setup_command_timeout_secs: 15 * 60,
            store_query_timeout_secs: 5 * 60,
            timeout_policy: TimeoutPolicy::Proceed,
            extra_packages: vec!["mlflow".to_string()],
            keep_workdir: true,
            runs_dir: None,
            health: HealthConfig::default(),
            shutdown: ShutdownConfig::default(),
            verification: VerificationConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.project_repo.trim().is_empty() {
            return Err(anyhow!("project_repo must be non-empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("port must be > 0"));
        }
        if self.execution_timeout_secs == 0 {
            return Err(anyhow!("execution_timeout_secs must be > 0"));
        }
        if self.smoke_timeout_secs == 0 {
            return Err(anyhow!("smoke_timeout_secs must be > 0"));
        }
        if self.setup_command_timeout_secs == 0 {
            return Err(anyhow!("setup_command_timeout_secs must be > 0"));
        }
        if self.store_query_timeout_secs == 0 {
            return Err(anyhow!("store_query_timeout_secs must be > 0"));
        }
        if self.health.max_attempts == 0 {
            return Err(anyhow!("health.max_attempts must be > 0"));
        }
        if self.verification.attempts == 0 {
            return Err(anyhow!("verification.attempts must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        Ok(())
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn smoke_timeout(&self) -> Duration {
        Duration::from_secs(self.smoke_timeout_secs)
    }

    pub fn setup_command_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_command_timeout_secs)
    }

    pub fn store_query_timeout(&self) -> Duration {
        Duration::from_secs(self.store_query_timeout_secs)
    }

    /// Directory name of the project checkout (last path segment of the repo URL).
    pub fn project_dir_name(&self) -> String {
        let trimmed = self.project_repo.trim_end_matches('/');
        let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
        last.trim_end_matches(".git").to_string()
    }
}

/// Values supplied on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub execution_timeout_secs: Option<u64>,
    pub port: Option<u16>,
    pub keep_workdir: Option<bool>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub verification_attempts: Option<u32>,
    pub runs_dir: Option<PathBuf>,
}

/// Apply command-line overrides to a base config and re-validate.
pub fn apply_overrides(mut base: HarnessConfig, overrides: &Overrides) -> Result<HarnessConfig> {
    if let Some(secs) = overrides.execution_timeout_secs {
        base.execution_timeout_secs = secs;
    }
    if let Some(port) = overrides.port {
        base.port = port;
    }
    if let Some(keep) = overrides.keep_workdir {
        base.keep_workdir = keep;
    }
    if let Some(policy) = overrides.timeout_policy {
        base.timeout_policy = policy;
    }
    if let Some(attempts) = overrides.verification_attempts {
        base.verification.attempts = attempts;
    }
    if let Some(dir) = &overrides.runs_dir {
        base.runs_dir = Some(dir.clone());
    }
    base.validate()?;
    Ok(base)
}

/// Load config from a TOML file.
///
/// If `path` is `None`, returns `HarnessConfig::default()`.
pub fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let Some(path) = path else {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_path_returns_default() {
        let cfg = load_config(None).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.execution_timeout_secs, 900);
        assert_eq!(cfg.health.max_attempts, 30);
        assert_eq!(cfg.timeout_policy, TimeoutPolicy::Proceed);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(
            &path,
            "port = 5055\ntimeout_policy = \"fail\"\n\n[verification]\nattempts = 3\n",
        )
        .expect("write");

        let cfg = load_config(Some(&path)).expect("load");
        assert_eq!(cfg.port, 5055);
        assert_eq!(cfg.timeout_policy, TimeoutPolicy::Fail);
        assert_eq!(cfg.verification.attempts, 3);
        assert_eq!(cfg.verification.backoff_secs, 5);
        assert_eq!(cfg.agent, AgentConfig::default());
    }

    #[test]
    fn rejects_zero_health_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(&path, "[health]\nmax_attempts = 0\n").expect("write");

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("health.max_attempts"));
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = Overrides {
            execution_timeout_secs: Some(60),
            port: Some(6000),
            keep_workdir: Some(false),
            timeout_policy: Some(TimeoutPolicy::Fail),
            verification_attempts: Some(2),
            runs_dir: Some(PathBuf::from("/tmp/runs")),
        };
        let merged = apply_overrides(HarnessConfig::default(), &overrides).expect("merge");
        assert_eq!(merged.execution_timeout_secs, 60);
        assert_eq!(merged.port, 6000);
        assert!(!merged.keep_workdir);
        assert_eq!(merged.timeout_policy, TimeoutPolicy::Fail);
        assert_eq!(merged.verification.attempts, 2);
        assert_eq!(merged.runs_dir, Some(PathBuf::from("/tmp/runs")));
    }

    #[test]
    fn override_to_zero_timeout_is_rejected() {
        let overrides = Overrides {
            execution_timeout_secs: Some(0),
            ..Overrides::default()
        };
        assert!(apply_overrides(HarnessConfig::default(), &overrides).is_err());
    }

    #[test]
    fn project_dir_name_comes_from_repo_url() {
        let mut cfg = HarnessConfig::default();
        assert_eq!(cfg.project_dir_name(), "mlflow-agent");
        cfg.project_repo = "git@github.com:org/thing.git".to_string();
        assert_eq!(cfg.project_dir_name(), "thing");
    }
}
