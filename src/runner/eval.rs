//! Accuracy evaluations with `lm_eval` against a locally served model.
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde_json::Value;

use crate::{
    config::Settings,
    error::{Error, SupervisorError},
    runner::{EVAL_CHANNEL, SCRIPT_CHANNEL, SERVER_CHANNEL, Transcript, server_config},
    server::{DEFAULT_POLL_INTERVAL, Readiness, ServerConfig, ServerController, tool_available},
    supervisor::{OutputRouting, ProcessCommand, ProcessSupervisor},
};

/// Server log lines shown when the server does not come up in time.
const NOT_READY_TAIL_LINES: usize = 200;

/// Parameters of one `lm_eval` run.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOptions {
    /// lm_eval task name, e.g. `gsm8k` or `leaderboard_gpqa_diamond`.
    pub task: String,
    pub limit: Option<u32>,
    pub num_concurrent: u32,
    pub batch_size: String,
    pub timeout: Duration,
}

impl EvalOptions {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            limit: None,
            num_concurrent: 256,
            batch_size: "auto".into(),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Starts the server, waits for it, and runs `lm_eval` against its completions API.
pub struct EvalRunner {
    settings: Settings,
    supervisor: ProcessSupervisor,
    server: ServerConfig,
    transcript: Transcript,
}

impl EvalRunner {
    /// Creates the runner and truncates the `server`, `eval`, and `script` channels.
    pub fn new(settings: Settings, supervisor: ProcessSupervisor) -> Result<Self, Error> {
        let logs = supervisor.logs();
        for channel in [SERVER_CHANNEL, EVAL_CHANNEL, SCRIPT_CHANNEL] {
            logs.init(channel)?;
        }

        Ok(Self {
            server: server_config(&settings),
            transcript: Transcript::new(logs.clone()),
            settings,
            supervisor,
        })
    }

    pub fn with_server_config(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn build_eval_command(&self, options: &EvalOptions) -> ProcessCommand {
        let settings = &self.settings;
        let mut argv = vec![
            settings.venv_tool("lm_eval"),
            "--model".into(),
            "local-completions".into(),
            "--model_args".into(),
            format!(
                "model={},base_url=http://{}:{}/v1/completions,num_concurrent={}",
                settings.model, settings.host, settings.port, options.num_concurrent
            ),
            "--tasks".into(),
            options.task.clone(),
            "--output_path".into(),
            settings.out_base.display().to_string(),
            "--log_samples".into(),
            "--batch_size".into(),
            options.batch_size.clone(),
        ];
        if let Some(limit) = options.limit {
            argv.extend(["--limit".into(), limit.to_string()]);
        }
        ProcessCommand::new(argv).env(self.settings.venv_env())
    }

    /// Runs the evaluation end to end and returns the process exit code to report.
    ///
    /// A server that never becomes ready yields 1 after logging the server log tail.
    /// A server that dies or logs a fatal error is an error.
    pub fn run_evaluation(&self, server_args: &str, options: &EvalOptions) -> Result<i32, Error> {
        let command = self.build_eval_command(options);
        if !tool_available(&command.argv[0]) {
            self.transcript
                .error("lm_eval not found! Install with: pip install lm-eval");
            return Ok(1);
        }

        let mut server = ServerController::new(self.server.clone(), self.supervisor.clone())?;
        let plan = server.build_launch(server_args, &Default::default())?;
        self.transcript.command("Server Command", &plan.command.display());

        self.transcript.info("Starting vLLM server...");
        server.start(server_args, self.settings.venv_env())?;
        let mut session = server.session();

        if session.wait_for_ready(self.settings.ready_timeout, DEFAULT_POLL_INTERVAL)?
            == Readiness::NotReady
        {
            self.transcript.error("Server failed to start within timeout");
            self.transcript
                .error(format!("Check server log: {}", session.log_path().display()));
            self.transcript
                .error(format!("Last {NOT_READY_TAIL_LINES} lines of server log:"));
            for line in self
                .supervisor
                .logs()
                .tail(SERVER_CHANNEL, NOT_READY_TAIL_LINES)
            {
                self.transcript.error(line);
            }
            return Ok(1);
        }

        self.transcript
            .info(format!("Running {} evaluation...", options.task));
        self.transcript
            .command("Evaluation Command", &command.display());

        let code = match self.supervisor.run(
            "lm_eval",
            &command,
            Some(options.timeout),
            OutputRouting::Log(EVAL_CHANNEL.to_string()),
        ) {
            Ok(outcome) if outcome.success() => {
                self.transcript.info("Evaluation complete!");
                self.transcript
                    .info(format!("Results: {}", self.settings.out_base.display()));
                self.transcript.info(format!(
                    "Eval log: {}",
                    self.supervisor.logs().path(EVAL_CHANNEL).display()
                ));
                0
            }
            Ok(outcome) => {
                self.transcript.error(format!(
                    "Evaluation failed with status: {}",
                    outcome.code()
                ));
                outcome.code()
            }
            Err(err @ SupervisorError::Interrupted { .. }) => return Err(err.into()),
            Err(err) => {
                self.transcript.error(format!("Evaluation error: {err}"));
                1
            }
        };

        drop(session);
        Ok(code)
    }

    /// Newest results file under the output directory.
    pub fn find_results(&self) -> Option<PathBuf> {
        find_results(&self.settings.out_base)
    }
}

/// Finds the newest `*/results_*.json`, falling back to the legacy
/// `results_*/results.json` layout.
///
/// Newest means lexicographically greatest, which matches lm_eval's timestamped names.
pub fn find_results(out_base: &Path) -> Option<PathBuf> {
    let Ok(entries) = fs::read_dir(out_base) else {
        return None;
    };
    let dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();

    let current = dirs
        .iter()
        .filter_map(|dir| fs::read_dir(dir).ok())
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("results_") && name.ends_with(".json"))
        })
        .max_by(|a, b| a.file_name().cmp(&b.file_name()));

    current.or_else(|| {
        dirs.iter()
            .filter(|dir| {
                dir.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("results_"))
            })
            .map(|dir| dir.join("results.json"))
            .filter(|path| path.is_file())
            .max()
    })
}

/// One metric of a task, e.g. `exact_match,strict-match`.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetric {
    pub name: String,
    pub value: f64,
    pub stderr: Option<f64>,
}

/// Metrics of one task extracted from an lm_eval results file.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalSummary {
    pub task: String,
    pub metrics: Vec<EvalMetric>,
}

impl EvalSummary {
    pub fn metric(&self, name: &str) -> Option<&EvalMetric> {
        self.metrics.iter().find(|metric| metric.name == name)
    }
}

impl fmt::Display for EvalSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} results:", self.task)?;
        for metric in &self.metrics {
            let name = metric.name.replace(',', " ");
            match metric.stderr {
                Some(stderr) => writeln!(
                    f,
                    "  {name:32}: {:6.2}% ± {:5.2}%",
                    metric.value * 100.0,
                    stderr * 100.0
                )?,
                None => writeln!(f, "  {name:32}: {:6.2}%", metric.value * 100.0)?,
            }
        }
        Ok(())
    }
}

/// Reads the metrics of `task` from an lm_eval results file.
///
/// Tasks are looked up by exact name, then by prefix (lm_eval may report `gsm8k` as
/// `gsm8k_cot`). Metrics are the numeric entries without `_stderr` in their name, each
/// paired with its `<metric>_stderr,<filter>` entry when present.
pub fn summarize(path: &Path, task: &str) -> Result<EvalSummary, Error> {
    let invalid = |reason: String| Error::Results {
        path: path.display().to_string(),
        reason,
    };

    let content = fs::read_to_string(path)?;
    let document: Value =
        serde_json::from_str(&content).map_err(|err| invalid(err.to_string()))?;
    let results = document
        .get("results")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("missing 'results' object".into()))?;

    let (task_name, entries) = results
        .iter()
        .find(|(name, _)| name.as_str() == task)
        .or_else(|| results.iter().find(|(name, _)| name.starts_with(task)))
        .and_then(|(name, entries)| Some((name.clone(), entries.as_object()?)))
        .ok_or_else(|| invalid(format!("no results for task '{task}'")))?;

    let mut metrics: Vec<EvalMetric> = entries
        .iter()
        .filter(|(name, _)| !name.contains("_stderr"))
        .filter_map(|(name, value)| {
            let value = value.as_f64()?;
            let stderr_key = match name.split_once(',') {
                Some((metric, filter)) => format!("{metric}_stderr,{filter}"),
                None => format!("{name}_stderr"),
            };
            Some(EvalMetric {
                name: name.clone(),
                value,
                stderr: entries.get(&stderr_key).and_then(Value::as_f64),
            })
        })
        .collect();
    metrics.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(EvalSummary {
        task: task_name,
        metrics,
    })
}
