//! Helpers for running child processes with timeouts.
//!
//! Two shapes are needed: [`run_logged`] streams combined output straight into
//! a log file (agent invocations, where a partial log must survive a timeout),
//! and [`run_captured`] keeps bounded stdout/stderr in memory (short tool and
//! store commands whose output is parsed).

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::config::ShutdownConfig;
use crate::io::server::TerminateOutcome;

/// Outcome of a bounded invocation. Non-zero exit and timeout are both
/// ordinary outcomes; only failing to start is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// Exit code, or `None` when the child was killed (timeout or signal).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl InvocationOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Shared slot holding the pid of the child a blocking invocation is waiting on.
///
/// [`run_logged`] fills the slot after spawning and clears it once the child
/// is reaped, so another thread (the interrupt handler) can stop the child
/// without owning its handle.
#[derive(Debug, Clone, Default)]
pub struct ForegroundChild {
    pid: Arc<Mutex<Option<u32>>>,
}

impl ForegroundChild {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pid of the child currently being waited on.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }

    fn register(&self, pid: u32) -> Registration<'_> {
        self.set(Some(pid));
        Registration { slot: self }
    }

    /// Send SIGTERM to the registered child and wait (bounded) for its waiter
    /// to reap it. Returns `None` when no child is registered.
    pub fn terminate(&self, shutdown: &ShutdownConfig) -> Option<TerminateOutcome> {
        let pid = self.pid()?;
        let Ok(raw) = i32::try_from(pid) else {
            warn!(pid, "foreground pid out of range");
            return Some(TerminateOutcome::StillRunning);
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Some(TerminateOutcome::AlreadyGone),
            Err(err) => {
                warn!(pid, err = %err, "failed to signal foreground child");
                return Some(TerminateOutcome::StillRunning);
            }
        }
        for _ in 0..shutdown.checks {
            if self.pid() != Some(pid) {
                return Some(TerminateOutcome::Stopped);
            }
            thread::sleep(shutdown.interval());
        }
        if self.pid() != Some(pid) {
            return Some(TerminateOutcome::Stopped);
        }
        Some(TerminateOutcome::StillRunning)
    }
}

/// Clears the slot when the waiting call returns.
struct Registration<'a> {
    slot: &'a ForegroundChild,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.slot.set(None);
    }
}

/// Run a command with a timeout, writing combined stdout/stderr to `log_path`.
///
/// Both streams are redirected to the same file handle, so output lands on
/// disk as the child writes it. On timeout the child is killed and reaped.
/// While the child runs its pid is held in `foreground`, if given.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), log = %log_path.display()))]
pub fn run_logged(
    mut cmd: Command,
    timeout: Duration,
    log_path: &Path,
    foreground: Option<&ForegroundChild>,
) -> Result<InvocationOutcome> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log = File::create(log_path)
        .with_context(|| format!("create log file {}", log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("clone log handle {}", log_path.display()))?;

    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(program = %program, err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };
    let registration = foreground.map(|slot| slot.register(child.id()));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            if let Err(e) = child.kill() {
                debug!(err = %e, "kill after timeout failed (already exited?)");
            }
            child.wait().context("wait command after kill")?
        }
    };
    drop(registration);

    let outcome = InvocationOutcome {
        exit_code: if timed_out { None } else { status.code() },
        timed_out,
        duration: started.elapsed(),
    };
    debug!(exit_code = ?outcome.exit_code, timed_out, "command finished");
    Ok(outcome)
}

/// Captured child process output.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CapturedOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Fail with a readable message unless the command exited 0 in time.
    pub fn ensure_success(&self, label: &str) -> Result<()> {
        if self.timed_out {
            bail!("{label} timed out");
        }
        if !self.status.success() {
            bail!(
                "{label} failed with status {:?}: {}",
                self.status.code(),
                self.stderr_text().trim()
            );
        }
        Ok(())
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_captured(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CapturedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!(program = %program, "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(program = %program, err = %e, "failed to spawn command");
            return Err(e).with_context(|| format!("spawn {program}"));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            if let Err(e) = child.kill() {
                debug!(err = %e, "kill after timeout failed (already exited?)");
            }
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Read at most the last `max_bytes` of a log file as lossy UTF-8.
pub fn read_tail(path: &Path, max_bytes: u64) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len > max_bytes {
        file.seek(SeekFrom::Start(len - max_bytes))
            .with_context(|| format!("seek {}", path.display()))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
