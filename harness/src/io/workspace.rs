//! Working directory creation and population.
//!
//! Each run gets a fresh, exclusively owned directory. Everything the run
//! produces (project checkout, server data, logs, reports) lives under it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Local;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use crate::core::naming::workdir_name;
use crate::io::process::run_captured;

const OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Create a fresh working directory under `base_dir`.
///
/// The leaf is created with `create_dir` (not `create_dir_all`) so an existing
/// directory is an error rather than silently shared.
pub fn create_workdir(base_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(base_dir)
        .with_context(|| format!("create runs dir {}", base_dir.display()))?;

    let name = workdir_name(&generate_timestamp(), &generate_short_id());
    let root = base_dir.join(name);
    fs::create_dir(&root).with_context(|| format!("create working dir {}", root.display()))?;
    Ok(root)
}

fn generate_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Produces a copy of the system under test.
pub trait ProjectSource {
    fn fetch(&self, dest: &Path) -> Result<()>;
}

/// Shallow `git clone` of a repository.
pub struct GitCheckout {
    repo: String,
    timeout: Duration,
}

impl GitCheckout {
    pub fn new(repo: impl Into<String>, timeout: Duration) -> Self {
        Self {
            repo: repo.into(),
            timeout,
        }
    }
}

impl ProjectSource for GitCheckout {
    #[instrument(skip_all, fields(repo = %self.repo))]
    fn fetch(&self, dest: &Path) -> Result<()> {
        info!(dest = %dest.display(), "cloning repository");
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", &self.repo]).arg(dest);
        let output = run_captured(cmd, self.timeout, OUTPUT_LIMIT_BYTES)?;
        output.ensure_success("git clone")
    }
}

/// Installs the project's dependencies.
pub trait PackageManager {
    /// Install the locked dependency set.
    fn sync(&self, project_dir: &Path) -> Result<()>;
    /// Add packages to the project.
    fn add(&self, project_dir: &Path, packages: &[String]) -> Result<()>;
}

/// `uv sync` / `uv add`.
pub struct UvPackages {
    timeout: Duration,
}

impl UvPackages {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn run(&self, project_dir: &Path, args: &[&str], label: &str) -> Result<()> {
        let mut cmd = Command::new("uv");
        cmd.args(args).current_dir(project_dir);
        let output = run_captured(cmd, self.timeout, OUTPUT_LIMIT_BYTES)?;
        output.ensure_success(label)
    }
}

impl PackageManager for UvPackages {
    #[instrument(skip_all, fields(project = %project_dir.display()))]
    fn sync(&self, project_dir: &Path) -> Result<()> {
        self.run(project_dir, &["sync"], "uv sync")
    }

    #[instrument(skip_all, fields(project = %project_dir.display(), packages = ?packages))]
    fn add(&self, project_dir: &Path, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add"];
        args.extend(packages.iter().map(String::as_str));
        self.run(project_dir, &args, "uv add")
    }
}

/// Copy the skill directory into `<project>/.claude/skills/<skill name>`.
pub fn install_skill(skill_dir: &Path, project_dir: &Path) -> Result<PathBuf> {
    let name = skill_dir
        .file_name()
        .with_context(|| format!("skill dir has no name: {}", skill_dir.display()))?;
    let dest = project_dir.join(".claude").join("skills").join(name);
    if dest.exists() {
        bail!("skill already installed at {}", dest.display());
    }
    let files = copy_tree(skill_dir, &dest)?;
    debug!(files, dest = %dest.display(), "skill installed");
    Ok(dest)
}

/// Recursively copy `src` into `dest` (created if missing). Returns files copied.
///
/// Symlinks are not followed.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut files = 0usize;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copy {} -> {}", entry.path().display(), target.display())
            })?;
            files += 1;
        }
    }
    Ok(files)
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
