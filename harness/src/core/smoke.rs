//! Judgment of the smoke-test invocation.

/// Whether the agent runtime answered the trivial prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmokeVerdict {
    /// The agent produced output; `excerpt` holds its first characters.
    Responsive { excerpt: String },
    /// The agent is not usable for the long invocation.
    Unresponsive { reason: String },
}

const EXCERPT_CHARS: usize = 100;

/// Classify a smoke-test invocation from its exit state and combined output.
pub fn assess(exit_code: Option<i32>, timed_out: bool, output: &str) -> SmokeVerdict {
    if timed_out {
        return SmokeVerdict::Unresponsive {
            reason: "agent smoke test timed out".to_string(),
        };
    }
    if output.trim().is_empty() {
        return SmokeVerdict::Unresponsive {
            reason: "agent smoke test produced no output".to_string(),
        };
    }
    if output.contains("Error") {
        return SmokeVerdict::Unresponsive {
            reason: format!("agent reported an error: {}", excerpt(output)),
        };
    }
    if exit_code != Some(0) {
        return SmokeVerdict::Unresponsive {
            reason: format!("agent smoke test exited with {exit_code:?}"),
        };
    }
    SmokeVerdict::Responsive {
        excerpt: excerpt(output),
    }
}

fn excerpt(output: &str) -> String {
    output.trim().chars().take(EXCERPT_CHARS).collect()
}
