//! Operator-facing tracing for harness runs.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: phase progress and failure reasons, output to
//!   stderr. Filtered via `RUST_LOG`.
//!
//! - **Run artifacts (`io/workspace`)**: logs and `verification.json` written
//!   under the working directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset because phase banners and
/// failure reasons are the primary operator output.
///
/// # Example
/// ```bash
/// RUST_LOG=harness=debug harness --timeout 600
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
