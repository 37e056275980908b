//! Side-effecting adapters: child processes, the tracking server and store,
//! the agent CLI, and the working directory layout.

pub mod agent;
pub mod process;
pub mod server;
pub mod store;
pub mod tools;
pub mod tracking_env;
pub mod workspace;
