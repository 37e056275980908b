//! End-to-end test harness for the agent-evaluation skill.
//!
//! A run stands up a disposable workspace, drives the agent CLI through one
//! real evaluation, and checks that the tracking store received the expected
//! artifacts. The crate keeps the same split as the rest of the workspace:
//!
//! - **[`core`]**: Pure, deterministic logic (naming, prompt assembly, smoke
//!   output judgment, verification reduction). No I/O.
//! - **[`io`]**: Side-effecting adapters (child processes, the tracking
//!   server, the tracking store, the agent CLI, filesystem layout).
//!
//! Orchestration modules ([`pipeline`], [`cleanup`], [`verify`]) compose the
//! two into a deterministic pass/fail verdict.

pub mod cleanup;
pub mod config;
pub mod context;
pub mod core;
pub mod exit_codes;
pub mod failure;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
