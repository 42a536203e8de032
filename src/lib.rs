//! servebench drives an inference server through benchmark and evaluation runs. It
//! launches the server under a process supervisor, races an HTTP readiness check against
//! the server log for fatal errors, runs client workloads, and guarantees every child
//! process group is torn down on completion, failure, or interrupt.

/// CLI interface.
pub mod cli;

/// Signal and exit cleanup.
pub mod cleanup;

/// Configuration management.
pub mod config;

/// Error handling.
pub mod error;

/// Git checkout and build steps.
pub mod git;

/// Named append-only log channels.
pub mod logs;

/// Benchmark and evaluation drivers.
pub mod runner;

/// Server lifecycle control.
pub mod server;

/// Process supervision.
pub mod supervisor;

/// Variant and environment spec parsing.
pub mod variant;
