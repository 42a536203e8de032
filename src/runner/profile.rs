//! Torch profiler captures of the server under a short `vllm bench serve --profile` load.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    config::Settings,
    error::{Error, SupervisorError},
    runner::{BENCH_CHANNEL, SCRIPT_CHANNEL, SERVER_CHANNEL, Transcript, server_config},
    server::{DEFAULT_POLL_INTERVAL, Readiness, ServerConfig, ServerController, tool_available},
    supervisor::{OutputRouting, ProcessCommand, ProcessSupervisor},
};

/// Suffix of the trace files the torch profiler writes.
pub const TRACE_SUFFIX: &str = ".pt.trace.json.gz";

/// Directory the server's torch profiler writes to.
const PROFILER_DIR_VAR: &str = "VLLM_TORCH_PROFILER_DIR";

/// Symmetric-memory allreduce breaks profiler captures with tensor parallelism.
const SYMM_MEM_VAR: &str = "VLLM_ALLREDUCE_USE_SYMM_MEM";

/// Parameters of one profiling run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOptions {
    /// Where the traces land. Old traces here are removed before the run.
    pub profile_dir: PathBuf,
    pub num_prompts: u32,
    pub timeout: Duration,
}

impl ProfileOptions {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            num_prompts: 50,
            timeout: Duration::from_secs(600),
        }
    }
}

/// A trace file written by one rank of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFile {
    pub path: PathBuf,
    pub size: u64,
}

impl TraceFile {
    /// Whether the file comes from a tensor-parallel rank, e.g. `host-rank-1.<pid>.pt.trace.json.gz`.
    pub fn is_rank_trace(&self) -> bool {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("-rank-"))
    }

    fn size_mb(&self) -> f64 {
        self.size as f64 / (1024.0 * 1024.0)
    }
}

/// Starts the server with the profiler enabled and drives a profiled benchmark against it.
pub struct ProfileRunner {
    settings: Settings,
    supervisor: ProcessSupervisor,
    server: ServerConfig,
    transcript: Transcript,
    options: ProfileOptions,
}

impl ProfileRunner {
    /// Creates the profile directory and truncates the `server`, `bench`, and `script` channels.
    pub fn new(
        settings: Settings,
        supervisor: ProcessSupervisor,
        mut options: ProfileOptions,
    ) -> Result<Self, Error> {
        fs::create_dir_all(&options.profile_dir)?;
        options.profile_dir = options.profile_dir.canonicalize()?;

        let logs = supervisor.logs();
        for channel in [SERVER_CHANNEL, BENCH_CHANNEL, SCRIPT_CHANNEL] {
            logs.init(channel)?;
        }

        Ok(Self {
            server: server_config(&settings),
            transcript: Transcript::new(logs.clone()),
            settings,
            supervisor,
            options,
        })
    }

    pub fn with_server_config(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn profile_dir(&self) -> &Path {
        &self.options.profile_dir
    }

    /// Environment for both the server and the benchmark client.
    pub fn profile_env(&self) -> BTreeMap<String, String> {
        let mut env = self.settings.venv_env();
        env.insert(
            PROFILER_DIR_VAR.to_string(),
            self.options.profile_dir.display().to_string(),
        );
        env.insert(SYMM_MEM_VAR.to_string(), "0".to_string());
        env
    }

    /// Server arguments with the tensor-parallel size always spelled out.
    pub fn server_args(&self, extra: &str) -> String {
        let tp = format!("-tp {}", self.settings.tensor_parallel_size);
        match extra.trim() {
            "" => tp,
            extra => format!("{tp} {extra}"),
        }
    }

    pub fn build_profile_command(&self) -> ProcessCommand {
        let settings = &self.settings;
        let argv = vec![
            settings.venv_tool("vllm"),
            "bench".into(),
            "serve".into(),
            "--model".into(),
            settings.model.clone(),
            "--backend".into(),
            "openai".into(),
            "--base-url".into(),
            format!("http://{}:{}", settings.host, settings.port),
            "--endpoint".into(),
            "/v1/completions".into(),
            "--random-input-len".into(),
            settings.random_in.to_string(),
            "--random-output-len".into(),
            settings.random_out.to_string(),
            "--num-prompts".into(),
            self.options.num_prompts.to_string(),
            "--profile".into(),
        ];
        ProcessCommand::new(argv).env(self.profile_env())
    }

    /// Removes traces left over from earlier runs and returns how many were removed.
    pub fn clear_traces(&self) -> Result<usize, Error> {
        let traces = list_traces(&self.options.profile_dir);
        for trace in &traces {
            fs::remove_file(&trace.path)?;
        }
        Ok(traces.len())
    }

    /// Runs the profile end to end and returns the process exit code to report.
    pub fn run_profile(&self, server_args: &str) -> Result<i32, Error> {
        let command = self.build_profile_command();
        if !tool_available(&command.argv[0]) {
            self.transcript
                .error("vllm not found! Install it into the virtualenv first");
            return Ok(1);
        }

        let removed = self.clear_traces()?;
        if removed > 0 {
            self.transcript
                .info(format!("Removed {removed} old trace file(s)"));
        }

        let server_args = self.server_args(server_args);
        let env = self.profile_env();
        let mut server = ServerController::new(self.server.clone(), self.supervisor.clone())?;
        let plan = server.build_launch(&server_args, &env)?;
        self.transcript.command(
            "Server Command",
            &format!(
                "export {PROFILER_DIR_VAR}={} {SYMM_MEM_VAR}=0 && {}",
                self.options.profile_dir.display(),
                plan.command.display()
            ),
        );

        self.transcript.info("Starting vLLM server with profiling enabled...");
        server.start(&server_args, env)?;
        let mut session = server.session();

        if session.wait_for_ready(self.settings.ready_timeout, DEFAULT_POLL_INTERVAL)?
            == Readiness::NotReady
        {
            self.transcript.error("Server failed to start within timeout");
            self.transcript
                .error(format!("Check server log: {}", session.log_path().display()));
            return Ok(1);
        }

        self.transcript.info("Running profiled benchmark...");
        self.transcript
            .command("Profile Command", &command.display());

        let code = match self.supervisor.run(
            "profile",
            &command,
            Some(self.options.timeout),
            OutputRouting::Log(BENCH_CHANNEL.to_string()),
        ) {
            Ok(outcome) if outcome.success() => {
                self.report_traces();
                0
            }
            Ok(outcome) => {
                self.transcript
                    .error(format!("Profiling failed with status: {}", outcome.code()));
                outcome.code()
            }
            Err(err @ SupervisorError::Interrupted { .. }) => return Err(err.into()),
            Err(err) => {
                self.transcript.error(format!("Profiling error: {err}"));
                1
            }
        };

        drop(session);
        Ok(code)
    }

    fn report_traces(&self) {
        self.transcript.info("Profiling complete!");
        let traces = list_traces(&self.options.profile_dir);

        if traces.is_empty() {
            self.transcript.warn(format!(
                "No trace files found in {}",
                self.options.profile_dir.display()
            ));
        } else {
            self.transcript
                .info(format!("Generated {} trace file(s):", traces.len()));
            for trace in &traces {
                let name = trace
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                if trace.size == 0 {
                    self.transcript.warn(format!("  {name} is empty"));
                } else {
                    self.transcript
                        .info(format!("  {name} ({:.2} MB)", trace.size_mb()));
                }
            }

            let ranks = traces.iter().filter(|trace| trace.is_rank_trace()).count();
            if ranks > 0 {
                self.transcript
                    .info(format!("Found {ranks} rank-specific trace(s)"));
            } else {
                self.transcript.warn("No rank-specific traces found");
            }
        }

        let logs = self.supervisor.logs();
        self.transcript.info(format!(
            "Profile dir: {}",
            self.options.profile_dir.display()
        ));
        self.transcript
            .info(format!("Server log: {}", logs.path(SERVER_CHANNEL).display()));
        self.transcript
            .info(format!("Bench log: {}", logs.path(BENCH_CHANNEL).display()));
    }
}

/// Trace files directly under `dir`, sorted by name.
pub fn list_traces(dir: &Path) -> Vec<TraceFile> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut traces: Vec<TraceFile> = entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(TRACE_SUFFIX))
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            metadata.is_file().then(|| TraceFile {
                path: entry.path(),
                size: metadata.len(),
            })
        })
        .collect();
    traces.sort_by(|a, b| a.path.cmp(&b.path));
    traces
}
