//! End-to-end test of the agent-evaluation skill.
//!
//! Clones the sample agent project, installs the skill, runs the agent CLI
//! headlessly against a tracking server, and checks that datasets, scorers
//! and traces were recorded. The exit code reports which phase failed.

use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{error, info, warn};

use harness::cleanup::{CleanupGuard, CleanupScope};
use harness::config::{Overrides, TimeoutPolicy, apply_overrides, load_config};
use harness::context::RunContext;
use harness::exit_codes;
use harness::io::tracking_env::OPENAI_API_KEY_VAR;
use harness::logging;
use harness::pipeline::{Backends, run_pipeline};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "End-to-end test for the agent-evaluation skill"
)]
struct Cli {
    /// Text appended to the evaluation prompt.
    extra_prompt: Option<String>,

    /// Path to the agent-evaluation skill.
    #[arg(long, default_value = "agent-evaluation")]
    skill_dir: PathBuf,

    /// Evaluation timeout in seconds [default: 900].
    #[arg(long = "timeout", value_name = "SECONDS")]
    timeout_secs: Option<u64>,

    /// Port for the local tracking server [default: 5000].
    #[arg(long)]
    mlflow_port: Option<u16>,

    /// Keep the working directory after the run (default).
    #[arg(long, overrides_with = "no_keep_workdir")]
    keep_workdir: bool,

    /// Remove the working directory after the run.
    #[arg(long, overrides_with = "keep_workdir")]
    no_keep_workdir: bool,

    /// Use an existing tracking server instead of starting one.
    #[arg(long, env = "MLFLOW_TRACKING_URI")]
    tracking_uri: Option<String>,

    /// TOML file with harness settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parent directory for working directories [default: <skill dir>/../test-runs].
    #[arg(long)]
    runs_dir: Option<PathBuf>,

    /// What an evaluation timeout means for the verdict.
    #[arg(long, value_enum)]
    timeout_policy: Option<TimeoutPolicy>,

    /// Verification attempts before giving up.
    #[arg(long)]
    verify_attempts: Option<u32>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let keep_workdir = if self.no_keep_workdir {
            Some(false)
        } else if self.keep_workdir {
            Some(true)
        } else {
            None
        };
        Overrides {
            execution_timeout_secs: self.timeout_secs,
            port: self.mlflow_port,
            keep_workdir,
            timeout_policy: self.timeout_policy,
            verification_attempts: self.verify_attempts,
            runs_dir: self.runs_dir.clone(),
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            exit_codes::SETUP_FAILED
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(cli.config.as_deref())
        .and_then(|base| apply_overrides(base, &cli.overrides()))
        .context("load harness config")?;
    // A missing directory is reported by the prerequisites phase.
    let skill_dir = cli
        .skill_dir
        .canonicalize()
        .unwrap_or_else(|_| cli.skill_dir.clone());
    let mut ctx = RunContext::new(
        config,
        skill_dir,
        cli.extra_prompt.unwrap_or_default(),
        cli.tracking_uri,
        env::var(OPENAI_API_KEY_VAR).ok(),
    );
    log_banner(&ctx);

    let scope = CleanupScope::new(ctx.config.shutdown.clone(), ctx.config.keep_workdir);
    install_interrupt_handler(scope.clone())?;
    let backends = Backends::production(&ctx.config, scope.foreground());

    let outcome = {
        let _guard = CleanupGuard::new(scope.clone());
        run_pipeline(&mut ctx, &backends, &scope)
    };
    if scope.was_interrupted() {
        return Ok(exit_codes::INTERRUPTED);
    }

    if let Some(report) = &ctx.report {
        println!("Verification (experiment {}):", report.experiment_id);
        for line in report.render_lines() {
            println!("  {line}");
        }
    }

    match outcome {
        Ok(_) => {
            info!(
                experiment = ctx.experiment_name.as_deref().unwrap_or_default(),
                experiment_id = ctx.experiment_id.as_deref().unwrap_or_default(),
                "all evaluation artifacts were created"
            );
            Ok(exit_codes::OK)
        }
        Err(failure) => {
            if let Some(log_file) = &ctx.log_file {
                info!(path = %log_file.display(), "agent output log");
            }
            Ok(failure.exit_code())
        }
    }
}

fn log_banner(ctx: &RunContext) {
    info!(started_at = %Local::now().format("%Y-%m-%d %H:%M:%S"), "agent-evaluation skill test");
    if !ctx.extra_prompt.is_empty() {
        info!(extra_prompt = %ctx.extra_prompt, "extra prompt");
    }
    if let Some(uri) = &ctx.external_tracking_uri {
        info!(tracking_uri = %uri, "external tracking server");
    }
    if ctx.openai_api_key.is_some() {
        info!("OPENAI_API_KEY provided; passing to agent and store commands");
    }
}

/// SIGINT/SIGTERM stop the running agent and run the shared cleanup, then
/// exit with the interrupted code.
fn install_interrupt_handler(scope: CleanupScope) -> Result<()> {
    ctrlc::set_handler(move || {
        warn!("interrupted; cleaning up");
        scope.interrupt();
        process::exit(exit_codes::INTERRUPTED);
    })
    .context("install interrupt handler")
}
