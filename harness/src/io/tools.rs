//! Prerequisite probes: executables on `PATH` and local port availability.

use std::env;
use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Resolve `tool` to an executable path the way a shell would.
///
/// Names containing a `/` are checked as paths; bare names are searched in
/// `PATH` order.
pub fn resolve_on_path(tool: &str) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return is_executable(&path).then_some(path);
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
}

/// Tools from `required` that do not resolve, in input order.
pub fn missing_tools(required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|tool| {
            let found = resolve_on_path(tool);
            debug!(tool = %tool, found = ?found, "resolved tool");
            found.is_none()
        })
        .cloned()
        .collect()
}

/// True when `host:port` can be bound right now.
pub fn port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
