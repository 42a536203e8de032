//! Benchmark, evaluation, and profiling drivers built on the supervisor and server controller.
pub mod bench;
pub mod eval;
pub mod profile;

pub use bench::{BenchmarkRunner, BranchPlan, RateOutcome, VariantOutcome, VariantReport};
pub use eval::{EvalOptions, EvalRunner, EvalSummary};
pub use profile::{ProfileOptions, ProfileRunner, TraceFile};

use tracing::{error, info, warn};

use crate::{config::Settings, logs::LogSink, server::ServerConfig};

/// Server output.
pub const SERVER_CHANNEL: &str = "server";
/// Benchmark client output.
pub const BENCH_CHANNEL: &str = "bench";
/// Evaluation harness output.
pub const EVAL_CHANNEL: &str = "eval";
/// Driver progress transcript.
pub const SCRIPT_CHANNEL: &str = "script";

const RULE: &str = "============================================================";

/// Progress reporting that goes to `tracing` and to the `script` log channel.
#[derive(Debug, Clone)]
pub struct Transcript {
    logs: LogSink,
}

impl Transcript {
    pub fn new(logs: LogSink) -> Self {
        Self { logs }
    }

    fn record(&self, line: &str) {
        if let Err(err) = self.logs.append_line(SCRIPT_CHANNEL, line) {
            warn!("Could not write to script log: {err}");
        }
    }

    pub fn info(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        info!("{line}");
        self.record(line);
    }

    pub fn warn(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        warn!("{line}");
        self.record(&format!("WARNING: {line}"));
    }

    pub fn error(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        error!("{line}");
        self.record(&format!("ERROR: {line}"));
    }

    /// A titled block of `key: value` lines between rules.
    pub fn banner(&self, title: &str, rows: &[(&str, String)]) {
        self.info(RULE);
        self.info(title);
        self.info(RULE);
        for (key, value) in rows {
            self.info(format!("{key}: {value}"));
        }
        self.info(RULE);
    }

    /// Logs a command line an operator can paste to reproduce a step.
    pub fn command(&self, title: &str, command: &str) {
        self.info(RULE);
        self.info(format!("{title} (for manual reproduction):"));
        self.info(format!("  {command}"));
        self.info(RULE);
    }
}

/// Server description derived from the run settings.
pub fn server_config(settings: &Settings) -> ServerConfig {
    ServerConfig::new(&settings.model, &settings.host, settings.port)
        .with_venv(Some(&settings.venv))
        .with_reservation_tool(settings.reservation_tool.clone())
}
