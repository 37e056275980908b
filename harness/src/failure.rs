//! Phase failures and their exit codes.

use std::fmt;

use thiserror::Error;

use crate::exit_codes;

/// The five pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prerequisites,
    Setup,
    SmokeTest,
    Execution,
    Verification,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Prerequisites => "prerequisites",
            Phase::Setup => "setup",
            Phase::SmokeTest => "smoke test",
            Phase::Execution => "execution",
            Phase::Verification => "verification",
        };
        f.write_str(label)
    }
}

/// Why a run stopped short of a passing verdict.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseFailure {
    #[error("prerequisites not met: {0}")]
    PrerequisiteUnmet(String),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error("smoke test failed: {0}")]
    SmokeTest(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("verification failed: {0}")]
    Verification(String),
}

impl PhaseFailure {
    pub fn phase(&self) -> Phase {
        match self {
            PhaseFailure::PrerequisiteUnmet(_) => Phase::Prerequisites,
            PhaseFailure::Setup(_) => Phase::Setup,
            PhaseFailure::SmokeTest(_) => Phase::SmokeTest,
            PhaseFailure::Execution(_) => Phase::Execution,
            PhaseFailure::Verification(_) => Phase::Verification,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PhaseFailure::PrerequisiteUnmet(_)
            | PhaseFailure::Setup(_)
            | PhaseFailure::SmokeTest(_) => exit_codes::SETUP_FAILED,
            PhaseFailure::Execution(_) => exit_codes::EXECUTION_FAILED,
            PhaseFailure::Verification(_) => exit_codes::VERIFICATION_FAILED,
        }
    }

    /// Wrap an I/O error chain as a setup failure.
    pub fn setup(err: anyhow::Error) -> Self {
        PhaseFailure::Setup(format!("{err:#}"))
    }
}
