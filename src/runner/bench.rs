//! Serving benchmarks across request rates, configuration variants, and git revisions.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;

use crate::{
    cleanup,
    config::Settings,
    error::{Error, SupervisorError},
    git::GitRepo,
    runner::{BENCH_CHANNEL, SERVER_CHANNEL, SCRIPT_CHANNEL, Transcript, server_config},
    server::{DEFAULT_POLL_INTERVAL, Parallelism, Readiness, ServerConfig, ServerController},
    supervisor::{OutputRouting, ProcessCommand, ProcessSupervisor},
    variant::Variant,
};

/// Appended to every benchmarked server launch.
pub const ALWAYS_SERVER_ARGS: &[&str] = &[
    "--no-enable-prefix-caching",
    "--disable-log-stats",
    "--trust-remote-code",
];

const CLIENT_SEED: &str = "42";

/// Runs of characters not allowed in a result filename.
static UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

/// One side of a run: a git ref and the variants to benchmark on it.
#[derive(Debug, Clone)]
pub struct BranchPlan {
    /// Display label, e.g. `MAIN`, `PR`, or `BENCH`.
    pub label: String,
    /// Ref to check out; `None` benchmarks the tree as it is.
    pub reference: Option<String>,
    pub variants: Vec<Variant>,
    pub results_dir: PathBuf,
    pub build: bool,
    pub pull: bool,
    /// Re-run rates whose result file already exists.
    pub force_rerun: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    /// A non-empty result file was already present.
    Reused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariantOutcome {
    /// Every rate already had a result and `--resume` was given.
    Skipped,
    /// The server never became ready.
    NotReady,
    Ran(Vec<(f64, RateOutcome)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantReport {
    pub branch: String,
    pub variant: String,
    pub outcome: VariantOutcome,
}

impl VariantReport {
    pub fn failed_rates(&self) -> usize {
        match &self.outcome {
            VariantOutcome::Ran(rates) => rates
                .iter()
                .filter(|(_, outcome)| *outcome == RateOutcome::Failed)
                .count(),
            _ => 0,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == VariantOutcome::NotReady || self.failed_rates() > 0
    }
}

/// Runs `vllm bench serve` against a freshly started server per variant.
pub struct BenchmarkRunner {
    settings: Settings,
    supervisor: ProcessSupervisor,
    server: ServerConfig,
    transcript: Transcript,
    base_args: String,
    resume: bool,
}

impl BenchmarkRunner {
    /// Creates the runner and truncates the `server`, `bench`, and `script` channels.
    pub fn new(settings: Settings, supervisor: ProcessSupervisor) -> Result<Self, Error> {
        let logs = supervisor.logs();
        for channel in [SERVER_CHANNEL, BENCH_CHANNEL, SCRIPT_CHANNEL] {
            logs.init(channel)?;
        }

        let base_args = base_server_args(&settings);
        Ok(Self {
            server: server_config(&settings),
            transcript: Transcript::new(logs.clone()),
            settings,
            supervisor,
            base_args,
            resume: false,
        })
    }

    /// Skip variants whose results are all present.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Replaces the server description, e.g. to point at a different program.
    pub fn with_server_config(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn base_args(&self) -> &str {
        &self.base_args
    }

    pub fn result_filename(&self, variant: &str, rate: f64) -> String {
        result_filename(&self.settings, variant, rate)
    }

    /// Whether a non-empty result file exists for `variant` at `rate`.
    pub fn result_exists(&self, results_dir: &Path, variant: &str, rate: f64) -> bool {
        fs::metadata(results_dir.join(self.result_filename(variant, rate)))
            .map(|meta| meta.len() > 0)
            .unwrap_or(false)
    }

    /// The benchmark client invocation for one rate.
    pub fn client_command(&self, results_dir: &Path, variant: &str, rate: f64) -> ProcessCommand {
        let settings = &self.settings;
        ProcessCommand::new([
            settings.venv_tool("vllm"),
            "bench".into(),
            "serve".into(),
            "--model".into(),
            settings.model.clone(),
            "--host".into(),
            settings.host.clone(),
            "--port".into(),
            settings.port.to_string(),
            "--dataset-name".into(),
            settings.dataset.clone(),
            "--random-input-len".into(),
            settings.random_in.to_string(),
            "--random-output-len".into(),
            settings.random_out.to_string(),
            "--random-range-ratio".into(),
            settings.random_range_ratio.to_string(),
            "--num-prompts".into(),
            num_prompts(rate, settings.run_seconds).to_string(),
            "--request-rate".into(),
            format_rate(rate),
            "--save-result".into(),
            "--result-dir".into(),
            results_dir.display().to_string(),
            "--result-filename".into(),
            self.result_filename(variant, rate),
            "--seed".into(),
            CLIENT_SEED.into(),
            "--ignore-eos".into(),
            "--trust-remote-code".into(),
        ])
        .env(settings.venv_env())
    }

    /// Runs the client for one rate unless a result already exists.
    ///
    /// Client failures and timeouts are reported as [`RateOutcome::Failed`]; only a
    /// shutdown interrupt is an error.
    pub fn run_client_for_rate(
        &self,
        results_dir: &Path,
        branch: &str,
        variant: &str,
        rate: f64,
        force_rerun: bool,
    ) -> Result<RateOutcome, SupervisorError> {
        let rate_label = format_rate(rate);
        if !force_rerun && self.result_exists(results_dir, variant, rate) {
            self.transcript
                .info(format!("Reusing existing result for {branch}/{variant} rate={rate_label}"));
            return Ok(RateOutcome::Reused);
        }

        let command = self.client_command(results_dir, variant, rate);
        self.transcript.info(format!(
            "Running client: {branch}/{variant} rate={rate_label} prompts={}",
            num_prompts(rate, self.settings.run_seconds)
        ));
        self.transcript.command("Benchmark Command", &command.display());

        let timeout = Duration::from_secs(self.settings.run_seconds * 3);
        let name = format!("bench_{branch}_{variant}_{rate_label}");
        match self.supervisor.run(
            &name,
            &command,
            Some(timeout),
            OutputRouting::Log(BENCH_CHANNEL.to_string()),
        ) {
            Ok(outcome) if outcome.success() => {
                self.transcript
                    .info(format!("Completed {branch}/{variant} rate={rate_label}"));
                Ok(RateOutcome::Completed)
            }
            Ok(outcome) => {
                self.transcript.error(format!(
                    "Benchmark failed for {branch}/{variant} rate={rate_label} (exit code {})",
                    outcome.code()
                ));
                Ok(RateOutcome::Failed)
            }
            Err(err @ SupervisorError::Interrupted { .. }) => Err(err),
            Err(err) => {
                self.transcript
                    .error(format!("Error running benchmark: {err}"));
                Ok(RateOutcome::Failed)
            }
        }
    }

    /// Starts the server for `variant`, runs every rate, and stops the server.
    ///
    /// A server that dies or logs a fatal error aborts the run with an error; one that
    /// merely fails to answer in time skips the variant.
    pub fn run_variant(
        &self,
        results_dir: &Path,
        branch: &str,
        variant: &Variant,
        force_rerun: bool,
    ) -> Result<VariantReport, Error> {
        let report = |outcome| VariantReport {
            branch: branch.to_string(),
            variant: variant.label.clone(),
            outcome,
        };

        self.transcript
            .info(format!("Starting variant: {branch}/{}", variant.label));

        if self.resume
            && !force_rerun
            && self
                .settings
                .rates
                .iter()
                .all(|rate| self.result_exists(results_dir, &variant.label, *rate))
        {
            self.transcript.info(format!(
                "Skipping {branch}/{} (all results present)",
                variant.label
            ));
            return Ok(report(VariantOutcome::Skipped));
        }

        let full_args = format!("{} {}", self.base_args, variant.args)
            .trim()
            .to_string();
        let mut env = self.settings.venv_env();
        env.extend(variant.env.clone());

        let mut server = ServerController::new(self.server.clone(), self.supervisor.clone())?;
        self.transcript.command(
            "Server Command",
            &reproduction_command(&self.server, &full_args, variant),
        );

        server.start(&full_args, env)?;
        let mut session = server.session();
        self.transcript.info(format!(
            "Starting server for {branch}/{}",
            variant.label
        ));

        if session.wait_for_ready(self.settings.ready_timeout, DEFAULT_POLL_INTERVAL)?
            == Readiness::NotReady
        {
            self.transcript.error(format!(
                "Server failed to start for {branch}/{}",
                variant.label
            ));
            self.transcript
                .error(format!("Check server log: {}", session.log_path().display()));
            return Ok(report(VariantOutcome::NotReady));
        }

        let mut outcomes = Vec::with_capacity(self.settings.rates.len());
        for &rate in &self.settings.rates {
            if cleanup::is_shutting_down() {
                break;
            }
            let outcome =
                self.run_client_for_rate(results_dir, branch, &variant.label, rate, force_rerun)?;
            outcomes.push((rate, outcome));
        }
        drop(session);

        self.transcript
            .info(format!("Completed variant: {branch}/{}", variant.label));
        Ok(report(VariantOutcome::Ran(outcomes)))
    }

    /// Checks out, optionally pulls and builds, then runs every variant of `plan`.
    pub fn run_branch(
        &self,
        git: Option<&GitRepo>,
        plan: &BranchPlan,
    ) -> Result<Vec<VariantReport>, Error> {
        self.transcript.banner(
            &format!(
                "Running {} branch: {}",
                plan.label,
                plan.reference.as_deref().unwrap_or("(working tree)")
            ),
            &[],
        );

        if let Some(git) = git {
            if let Some(reference) = &plan.reference {
                git.checkout(reference)?;
                if plan.pull {
                    git.pull(reference);
                }
            }
            if plan.build {
                git.build()?;
            }
        }

        fs::create_dir_all(&plan.results_dir)?;
        let mut reports = Vec::with_capacity(plan.variants.len());
        for variant in &plan.variants {
            if cleanup::is_shutting_down() {
                break;
            }
            reports.push(self.run_variant(&plan.results_dir, &plan.label, variant, plan.force_rerun)?);
        }
        Ok(reports)
    }

    /// Runs each plan in order and logs where results went.
    pub fn run_plans(
        &self,
        title: &str,
        git: Option<&GitRepo>,
        plans: &[BranchPlan],
    ) -> Result<Vec<VariantReport>, Error> {
        let settings = &self.settings;
        let mut rows = vec![
            ("Model", settings.model.clone()),
            ("Dataset", settings.dataset.clone()),
            (
                "Rates",
                settings
                    .rates
                    .iter()
                    .map(|rate| format_rate(*rate))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("Repository", settings.repo_dir.display().to_string()),
        ];
        for plan in plans {
            rows.push(("Results", format!("{} -> {}", plan.label, plan.results_dir.display())));
        }
        rows.push(("Logs", settings.log_dir.display().to_string()));
        self.transcript.banner(title, &rows);

        let mut reports = Vec::new();
        for plan in plans {
            reports.extend(self.run_branch(git, plan)?);
        }

        self.transcript.info(format!("{title} completed!"));
        for report in reports.iter().filter(|report| report.is_failure()) {
            self.transcript.warn(format!(
                "{}/{}: {:?}",
                report.branch, report.variant, report.outcome
            ));
        }
        Ok(reports)
    }
}

/// `server_args_base`, `-tp N` when requested and absent, then [`ALWAYS_SERVER_ARGS`].
pub fn base_server_args(settings: &Settings) -> String {
    let mut args: Vec<String> = shell_words::split(&settings.server_args_base)
        .unwrap_or_else(|_| {
            settings
                .server_args_base
                .split_whitespace()
                .map(str::to_string)
                .collect()
        });

    if settings.tensor_parallel_size > 1 && Parallelism::from_args(&args).tensor.is_none() {
        args.extend(["-tp".to_string(), settings.tensor_parallel_size.to_string()]);
    }
    args.extend(ALWAYS_SERVER_ARGS.iter().map(|arg| arg.to_string()));
    shell_words::join(args)
}

/// Number of prompts for one rate: `floor(rate × run_seconds)`.
pub fn num_prompts(rate: f64, run_seconds: u64) -> u64 {
    (rate * run_seconds as f64).floor() as u64
}

/// Renders a rate with at least one decimal place, e.g. `1.0` or `2.5`.
pub fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{rate:.1}")
    } else {
        rate.to_string()
    }
}

/// `bench_model-{terse}_rate-{rate}_v-{variant}_np-{n}_in-{in}_out-{out}_ds-{ds}{suffix}.json`
pub fn result_filename(settings: &Settings, variant: &str, rate: f64) -> String {
    let dataset = UNSAFE_FILENAME_CHARS.replace_all(&settings.dataset, "-");
    let suffix = if settings.label_suffix.is_empty() {
        String::new()
    } else {
        format!("_{}", settings.label_suffix)
    };

    format!(
        "bench_model-{}_rate-{}_v-{}_np-{}_in-{}_out-{}_ds-{}{}.json",
        settings.terse_name,
        format_rate(rate),
        variant,
        num_prompts(rate, settings.run_seconds),
        settings.random_in,
        settings.random_out,
        dataset,
        suffix
    )
}

fn reproduction_command(server: &ServerConfig, args: &str, variant: &Variant) -> String {
    let mut parts: Vec<String> = variant
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    parts.extend(server.program.iter().cloned());
    parts.extend([
        server.model.clone(),
        "--host".into(),
        server.host.clone(),
        "--port".into(),
        server.port.to_string(),
    ]);
    if !args.is_empty() {
        parts.push(args.to_string());
    }
    parts.join(" ")
}
