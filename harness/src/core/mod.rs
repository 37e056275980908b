//! Deterministic, pure logic shared by the harness phases.
//!
//! Core modules must be free of I/O side effects. They operate on plain
//! values and return deterministic outputs suitable for tests.

pub mod naming;
pub mod prompt;
pub mod report;
pub mod smoke;
