//! Command-line interface for servebench.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{RunConfig, parse_rates},
    error::ConfigError,
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Which side(s) of a comparison to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Which {
    #[default]
    Both,
    Main,
    Pr,
}

impl Which {
    pub fn includes_main(self) -> bool {
        matches!(self, Which::Both | Which::Main)
    }

    pub fn includes_pr(self) -> bool {
        matches!(self, Which::Both | Which::Pr)
    }
}

/// Command-line interface for servebench.
#[derive(Parser)]
#[command(name = "servebench", version, author)]
#[command(
    about = "Benchmark and evaluate an inference server across variants and revisions",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// YAML run plan (defaults to `servebench.yaml` when present).
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Options describing the server under test.
#[derive(Args, Debug, Clone, Default)]
pub struct ServerOptions {
    /// Model (HF id or local path).
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Virtualenv path.
    #[arg(long)]
    pub venv: Option<PathBuf>,

    /// Base output directory.
    #[arg(long)]
    pub out_base: Option<PathBuf>,

    /// Log directory (default: <out-base>/logs).
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Seconds to wait for the server to become ready.
    #[arg(long, value_name = "SECONDS")]
    pub ready_timeout: Option<u64>,

    /// Accelerator reservation wrapper (default: chg).
    #[arg(long, value_name = "TOOL")]
    pub reservation_tool: Option<String>,

    /// Launch the server without a reservation wrapper.
    #[arg(long, conflicts_with = "reservation_tool")]
    pub no_reservation: bool,
}

impl ServerOptions {
    pub fn to_run_config(&self) -> RunConfig {
        RunConfig {
            model: self.model.clone(),
            host: self.host.clone(),
            port: self.port,
            venv: self.venv.clone(),
            out_base: self.out_base.clone(),
            log_dir: self.log_dir.clone(),
            ready_timeout: self.ready_timeout,
            reservation_tool: if self.no_reservation {
                Some(String::new())
            } else {
                self.reservation_tool.clone()
            },
            ..Default::default()
        }
    }
}

/// Options shared by the benchmark commands.
#[derive(Args, Debug, Clone, Default)]
pub struct BenchOptions {
    #[command(flatten)]
    pub server: ServerOptions,

    /// Short name for filenames (default: derived from model).
    #[arg(long)]
    pub terse_name: Option<String>,

    #[arg(long)]
    pub dataset: Option<String>,

    /// Random input length.
    #[arg(long)]
    pub random_in: Option<u32>,

    /// Random output length.
    #[arg(long)]
    pub random_out: Option<u32>,

    #[arg(long)]
    pub random_range_ratio: Option<f64>,

    /// Tensor-parallel size.
    #[arg(long = "tensor-parallel-size", visible_alias = "tp")]
    pub tensor_parallel_size: Option<u32>,

    /// Request rates CSV (default: 1,5,10,25,100).
    #[arg(long, value_name = "CSV")]
    pub rates: Option<String>,

    /// Seconds per rate.
    #[arg(long)]
    pub run_seconds: Option<u64>,

    /// Git repository directory.
    #[arg(long)]
    pub repo_dir: Option<PathBuf>,

    /// Args added to every server run.
    #[arg(long, allow_hyphen_values = true)]
    pub server_args_base: Option<String>,

    /// Suffix for result filenames.
    #[arg(long)]
    pub label_suffix: Option<String>,

    /// Resume and only run missing combinations.
    #[arg(long)]
    pub resume: bool,
}

impl BenchOptions {
    pub fn to_run_config(&self) -> Result<RunConfig, ConfigError> {
        let overrides = RunConfig {
            terse_name: self.terse_name.clone(),
            dataset: self.dataset.clone(),
            random_in: self.random_in,
            random_out: self.random_out,
            random_range_ratio: self.random_range_ratio,
            tensor_parallel_size: self.tensor_parallel_size,
            rates: self.rates.as_deref().map(parse_rates).transpose()?,
            run_seconds: self.run_seconds,
            repo_dir: self.repo_dir.clone(),
            server_args_base: self.server_args_base.clone(),
            label_suffix: self.label_suffix.clone(),
            ..Default::default()
        };
        Ok(self.server.to_run_config().merge(overrides))
    }
}

/// Available commands for servebench.
#[derive(Subcommand)]
pub enum Commands {
    /// Benchmark MAIN and PR revisions of the server across variants.
    Compare {
        #[command(flatten)]
        bench: BenchOptions,

        /// Ref to check out for MAIN.
        #[arg(long, default_value = "main")]
        main_ref: String,

        /// Ref to check out for PR.
        #[arg(long)]
        pr_ref: Option<String>,

        /// Which side(s) to run.
        #[arg(long, value_enum, default_value_t = Which::default())]
        which: Which,

        /// Build extensions after checking out MAIN.
        #[arg(long)]
        build_main: bool,

        /// Build extensions after checking out PR.
        #[arg(long)]
        build_pr: bool,

        /// Pull latest for MAIN and PR.
        #[arg(long)]
        pull_latest: bool,

        #[arg(long)]
        pull_latest_main: bool,

        #[arg(long)]
        pull_latest_pr: bool,

        /// With --resume, re-run all MAIN variants.
        #[arg(long)]
        re_run_main: bool,

        /// With --resume, re-run all PR variants.
        #[arg(long)]
        re_run_pr: bool,

        /// Results directory for MAIN.
        #[arg(long)]
        results_main: Option<PathBuf>,

        /// Results directory for PR.
        #[arg(long)]
        results_pr: Option<PathBuf>,

        /// Extra args for the MAIN server when no variants are given.
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        server_args_main: String,

        /// Extra args for the PR server when no variants are given.
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        server_args_pr: String,

        /// Variant spec for both sides, e.g. 'base::;fullcg::-O {"full_cuda_graph":true}'.
        #[arg(long, allow_hyphen_values = true)]
        variants: Option<String>,

        #[arg(long, allow_hyphen_values = true)]
        variants_main: Option<String>,

        #[arg(long, allow_hyphen_values = true)]
        variants_pr: Option<String>,
    },

    /// Benchmark the current (or given) revision across variants.
    Bench {
        #[command(flatten)]
        bench: BenchOptions,

        /// Check out this ref first (default: benchmark the tree as it is).
        #[arg(long)]
        branch: Option<String>,

        /// Build extensions before benchmarking.
        #[arg(long)]
        build: bool,

        /// Pull latest changes after checkout.
        #[arg(long)]
        pull_latest: bool,

        /// Results directory (default: <out-base>/bench_<model>_<dataset>).
        #[arg(long)]
        results_dir: Option<PathBuf>,

        /// Variant spec, e.g. 'base::;full::-O.cudagraph_mode=FULL'.
        #[arg(long, allow_hyphen_values = true)]
        variants: Option<String>,
    },

    /// Run an lm_eval accuracy task against the served model.
    Eval {
        #[command(flatten)]
        server: ServerOptions,

        /// lm_eval task, e.g. gsm8k or leaderboard_gpqa_diamond.
        #[arg(long, default_value = "gsm8k")]
        task: String,

        /// Limit number of test cases.
        #[arg(long)]
        limit: Option<u32>,

        /// Number of concurrent requests.
        #[arg(long, default_value_t = 256)]
        num_concurrent: u32,

        /// Batch size for lm_eval.
        #[arg(long, default_value = "auto")]
        batch_size: String,

        /// Additional server arguments (quoted string).
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        server_args: String,

        /// Evaluation timeout in seconds.
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },

    /// Capture torch profiler traces of the server under a short benchmark.
    Profile {
        #[command(flatten)]
        server: ServerOptions,

        /// Random input length (default: 1000).
        #[arg(long = "random-input-len", visible_alias = "random-in")]
        random_in: Option<u32>,

        /// Random output length (default: 100).
        #[arg(long = "random-output-len", visible_alias = "random-out")]
        random_out: Option<u32>,

        /// Number of prompts in the profiled run.
        #[arg(long, default_value_t = 50)]
        num_prompts: u32,

        /// Tensor-parallel size (default: 1).
        #[arg(long = "tensor-parallel-size", visible_alias = "tp")]
        tensor_parallel_size: Option<u32>,

        /// Additional server arguments (quoted string).
        #[arg(long, default_value = "", allow_hyphen_values = true)]
        server_args: String,

        /// Directory for trace files (logs go to <profile-dir>/logs).
        #[arg(long, default_value = "./vllm-profiles")]
        profile_dir: PathBuf,

        /// Profiled benchmark timeout in seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },

    /// Show the last lines of a log channel.
    Logs {
        /// Channel name: server, bench, eval, or script.
        #[arg(default_value = "server")]
        channel: String,

        /// Log directory.
        #[arg(long, default_value = "./results/logs")]
        log_dir: PathBuf,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Keep printing lines as they are appended.
        #[arg(short, long)]
        follow: bool,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
