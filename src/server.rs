//! Lifecycle of the inference server under test.
//!
//! `start` launches the server through the [`ProcessSupervisor`], `wait_for_ready`
//! races an HTTP health check against a scan of the server log for fatal errors, and `stop`
//! hands the process back to the supervisor's escalating shutdown.
use std::{
    collections::BTreeMap,
    env,
    ops::{Deref, DerefMut},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use reqwest::{StatusCode, blocking::Client};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    error::{ServerError, SupervisorError},
    logs::{LogSink, PatternSet},
    supervisor::{OutputRouting, ProcessCommand, ProcessSupervisor},
    variant::Variant,
};

/// Log lines indicating a startup failure the server will not recover from.
pub const DEFAULT_FATAL_PATTERNS: &[&str] = &[
    r"AssertionError",
    r"OutOfMemoryError",
    r"CUDA out of memory",
    r"RuntimeError.*CUDA",
    r"Failed to allocate",
    r"torch\.cuda\.OutOfMemoryError",
    r"Cannot allocate memory",
    r"killed by signal",
    r"Segmentation fault",
    r"chg:.*No GPUs available",
    r"chg:.*GPU allocation failed",
];

/// Default budget for [`ServerController::wait_for_ready`].
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(600);
/// Default pause between readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const TENSOR_PARALLEL_FLAGS: &[&str] = &["-tp", "--tensor-parallel-size"];
const DATA_PARALLEL_FLAGS: &[&str] = &["-dp", "--data-parallel-size"];

/// Lifecycle state of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ServerState {
    Stopped,
    Starting,
    Ready,
    Failed,
    Stopping,
}

/// Non-exceptional result of [`ServerController::wait_for_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The budget ran out without a ready signal or a detected fatal error.
    NotReady,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

/// Static description of the server to launch.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Model identifier passed to the server.
    pub model: String,
    pub host: String,
    pub port: u16,
    /// Program and leading subcommand, e.g. `["vllm", "serve"]`.
    pub program: Vec<String>,
    /// Log channel receiving the server's output.
    pub log_channel: String,
    /// Wrapper used to reserve accelerators, invoked as `<tool> run -g <N> --`.
    pub reservation_tool: Option<String>,
    pub fatal_patterns: Vec<String>,
    /// Timeout of a single health or models request.
    pub health_timeout: Duration,
    /// Minimum spacing between fatal-pattern scans of the log.
    pub log_scan_interval: Duration,
    /// Pause between stop and start on restart, letting the port be released.
    pub restart_pause: Duration,
    /// Number of log lines attached to fatal errors.
    pub tail_lines: usize,
}

impl ServerConfig {
    pub fn new(model: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            model: model.into(),
            host: host.into(),
            port,
            program: vec!["vllm".into(), "serve".into()],
            log_channel: "server".into(),
            reservation_tool: Some("chg".into()),
            fatal_patterns: DEFAULT_FATAL_PATTERNS.iter().map(|p| p.to_string()).collect(),
            health_timeout: Duration::from_secs(2),
            log_scan_interval: Duration::from_secs(2),
            restart_pause: Duration::from_secs(2),
            tail_lines: 100,
        }
    }

    /// Uses `<venv>/bin/vllm` when it exists, plain `vllm` otherwise.
    pub fn with_venv(mut self, venv: Option<&Path>) -> Self {
        let program = venv
            .map(|venv| venv.join("bin").join("vllm"))
            .filter(|candidate| candidate.exists())
            .map(|candidate| candidate.display().to_string())
            .unwrap_or_else(|| "vllm".to_string());
        self.program = vec![program, "serve".into()];
        self
    }

    /// Replaces the launched program and its leading arguments.
    pub fn with_program<I, S>(mut self, program: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reservation_tool(mut self, tool: Option<String>) -> Self {
        self.reservation_tool = tool;
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url())
    }

    pub fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url())
    }

    /// Supervisor name of the server process; one per host and port.
    pub fn process_name(&self) -> String {
        format!("server@{}:{}", self.host, self.port)
    }
}

/// Tensor- and data-parallel degrees requested by a launch argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Parallelism {
    pub tensor: Option<u32>,
    pub data: Option<u32>,
}

impl Parallelism {
    /// Reads `-tp`/`--tensor-parallel-size` and `-dp`/`--data-parallel-size`, in either
    /// `--flag N` or `--flag=N` form. The first occurrence wins.
    pub fn from_args(args: &[String]) -> Self {
        Self {
            tensor: flag_value(args, TENSOR_PARALLEL_FLAGS),
            data: flag_value(args, DATA_PARALLEL_FLAGS),
        }
    }

    /// Exclusive resource units needed: tensor × data, each defaulting to 1.
    pub fn units(&self) -> u32 {
        self.tensor.unwrap_or(1).max(1) * self.data.unwrap_or(1).max(1)
    }
}

fn flag_value(args: &[String], flags: &[&str]) -> Option<u32> {
    args.iter().enumerate().find_map(|(idx, arg)| {
        flags.iter().find_map(|flag| {
            if arg == flag {
                args.get(idx + 1)?.parse().ok()
            } else {
                arg.strip_prefix(flag)?.strip_prefix('=')?.parse().ok()
            }
        })
    })
}

/// Whether an executable named `tool` is on `PATH`.
pub fn tool_available(tool: &str) -> bool {
    let candidate = Path::new(tool);
    if candidate.components().count() > 1 {
        return is_executable(candidate);
    }

    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| is_executable(&dir.join(tool))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// A fully resolved server launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub command: ProcessCommand,
    /// Resource units the arguments ask for.
    pub units: u32,
    /// Whether the command is wrapped in a reservation.
    pub reserved: bool,
}

/// Drives one server through start, readiness, and stop.
pub struct ServerController {
    config: ServerConfig,
    supervisor: ProcessSupervisor,
    patterns: PatternSet,
    client: Client,
    state: ServerState,
    last_args: String,
    last_env: BTreeMap<String, String>,
}

impl ServerController {
    pub fn new(config: ServerConfig, supervisor: ProcessSupervisor) -> Result<Self, ServerError> {
        let patterns = PatternSet::new(&config.fatal_patterns)?;
        let client = Client::builder().timeout(config.health_timeout).build()?;
        Ok(Self {
            config,
            supervisor,
            patterns,
            client,
            state: ServerState::Stopped,
            last_args: String::new(),
            last_env: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    fn logs(&self) -> &LogSink {
        self.supervisor.logs()
    }

    /// Arguments of the most recent `start`.
    pub fn last_args(&self) -> &str {
        &self.last_args
    }

    /// Environment overrides of the most recent `start`.
    pub fn last_env(&self) -> &BTreeMap<String, String> {
        &self.last_env
    }

    /// Whether the server process is alive.
    pub fn is_running(&self) -> bool {
        self.supervisor.is_alive(&self.config.process_name())
    }

    /// Builds the launch command for `args`, prefixing a reservation when needed.
    pub fn build_launch(
        &self,
        args: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<LaunchPlan, ServerError> {
        let arg_list = shell_words::split(args).map_err(|err| ServerError::InvalidArgs {
            args: args.to_string(),
            reason: err.to_string(),
        })?;
        let units = Parallelism::from_args(&arg_list).units();

        let mut argv = self.config.program.clone();
        argv.extend([
            self.config.model.clone(),
            "--host".into(),
            self.config.host.clone(),
            "--port".into(),
            self.config.port.to_string(),
        ]);
        argv.extend(arg_list);

        // Multi-unit launches always reserve; a single unit only when the tool is installed.
        let tool = self
            .config
            .reservation_tool
            .as_deref()
            .filter(|tool| units > 1 || tool_available(tool));

        let reserved = match tool {
            Some(tool) => {
                info!("Using {tool} to reserve {units} GPU(s)");
                let mut prefixed = vec![
                    tool.to_string(),
                    "run".into(),
                    "-g".into(),
                    units.to_string(),
                    "--".into(),
                ];
                prefixed.append(&mut argv);
                argv = prefixed;
                true
            }
            None => {
                if units > 1 {
                    warn!("Reservation disabled, launching without GPU reservation (need {units} GPUs)");
                }
                false
            }
        };

        Ok(LaunchPlan {
            command: ProcessCommand::new(argv).env(env.clone()),
            units,
            reserved,
        })
    }

    /// Launches the server and moves to [`ServerState::Starting`].
    ///
    /// The server log channel is truncated first, so fatal-pattern scans only see this
    /// attempt's output.
    pub fn start(
        &mut self,
        args: &str,
        env: BTreeMap<String, String>,
    ) -> Result<u32, ServerError> {
        if matches!(self.state, ServerState::Starting | ServerState::Ready) {
            return Err(ServerError::AlreadyRunning);
        }

        let name = self.config.process_name();
        if self.supervisor.is_alive(&name) {
            return Err(SupervisorError::AlreadyRunning { name }.into());
        }

        let plan = self.build_launch(args, &env)?;
        info!("Starting server: {}", plan.command.display());
        if !env.is_empty() {
            info!("Environment: {}", crate::variant::format_env_csv(&env));
        }

        self.logs().init(&self.config.log_channel)?;
        let pid = self.supervisor.run_background(
            &name,
            &plan.command,
            OutputRouting::Log(self.config.log_channel.clone()),
        )?;

        self.last_args = args.to_string();
        self.last_env = env;
        self.state = ServerState::Starting;
        Ok(pid)
    }

    /// Starts the server with a variant's arguments appended to `base_args`.
    pub fn start_variant(&mut self, base_args: &str, variant: &Variant) -> Result<u32, ServerError> {
        let args = format!("{} {}", base_args, variant.args).trim().to_string();
        self.start(&args, variant.env.clone())
    }

    /// Polls until the server answers, dies, logs a fatal error, or `timeout` passes.
    ///
    /// Each round checks, in order: process liveness, the server log for fatal
    /// patterns (at most every `log_scan_interval`), then the health endpoint with the
    /// models endpoint as fallback. A dead process or fatal log line is an error with the
    /// log tail attached; running out of time is [`Readiness::NotReady`].
    pub fn wait_for_ready(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Readiness, ServerError> {
        match self.state {
            ServerState::Ready => return Ok(Readiness::Ready),
            ServerState::Starting => {}
            _ => return Err(ServerError::NotStarted),
        }

        let name = self.config.process_name();
        let channel = self.config.log_channel.clone();
        info!(
            "Waiting for server at {} (timeout: {timeout:?})...",
            self.config.health_url()
        );

        let deadline = Instant::now() + timeout;
        let mut last_scan: Option<Instant> = None;

        while Instant::now() < deadline {
            if !self.supervisor.is_alive(&name) {
                self.state = ServerState::Failed;
                return Err(ServerError::ProcessDied {
                    tail: self.logs().tail_string(&channel, self.config.tail_lines),
                });
            }

            if last_scan.is_none_or(|at| at.elapsed() >= self.config.log_scan_interval) {
                if let Some(found) = self.logs().search(&channel, &self.patterns, 0) {
                    self.state = ServerState::Failed;
                    return Err(ServerError::FatalLog {
                        pattern: found.pattern,
                        line: found.line,
                        tail: self.logs().tail_string(&channel, self.config.tail_lines),
                    });
                }
                last_scan = Some(Instant::now());
            }

            if self.check_health(deadline) {
                info!("Server is ready!");
                self.state = ServerState::Ready;
                return Ok(Readiness::Ready);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(poll_interval.min(remaining));
        }

        warn!("Server did not become ready after {timeout:?}");
        self.state = ServerState::Failed;
        Ok(Readiness::NotReady)
    }

    /// One round of HTTP health checks. Transport errors mean "not yet".
    ///
    /// No request outlives `deadline`; the models fallback is skipped once it passes.
    fn check_health(&self, deadline: Instant) -> bool {
        [self.config.health_url(), self.config.models_url()]
            .iter()
            .any(|url| {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return false;
                }

                let request = self
                    .client
                    .get(url)
                    .timeout(self.config.health_timeout.min(remaining));
                match request.send() {
                    Ok(response) => response.status() == StatusCode::OK,
                    Err(err) => {
                        debug!("Health check of {url} failed: {err}");
                        false
                    }
                }
            })
    }

    /// Stops the server. A no-op for a session that never started or already stopped.
    pub fn stop(&mut self) {
        debug!("Stop requested in state {}", self.state);

        if self.state != ServerState::Stopped {
            self.state = ServerState::Stopping;
            self.supervisor.terminate(&self.config.process_name());
        }
        self.state = ServerState::Stopped;
    }

    /// Stops, waits for the port to be released, then starts again with the given
    /// arguments or the ones remembered from the last start.
    pub fn restart(
        &mut self,
        args: Option<&str>,
        env: Option<BTreeMap<String, String>>,
    ) -> Result<u32, ServerError> {
        self.stop();
        thread::sleep(self.config.restart_pause);

        let args = args.map(str::to_string).unwrap_or_else(|| self.last_args.clone());
        let env = env.unwrap_or_else(|| self.last_env.clone());
        self.start(&args, env)
    }

    /// Scope guard that stops the server exactly once when dropped.
    ///
    /// `start` must already have been called.
    pub fn session(&mut self) -> ServerSession<'_> {
        ServerSession { controller: self }
    }

    /// Path of the server log, for operator messages.
    pub fn log_path(&self) -> PathBuf {
        self.logs().path(&self.config.log_channel)
    }
}

/// Borrow of a started [`ServerController`] that stops it on every exit path.
pub struct ServerSession<'a> {
    controller: &'a mut ServerController,
}

impl Deref for ServerSession<'_> {
    type Target = ServerController;

    fn deref(&self) -> &ServerController {
        self.controller
    }
}

impl DerefMut for ServerSession<'_> {
    fn deref_mut(&mut self) -> &mut ServerController {
        self.controller
    }
}

impl Drop for ServerSession<'_> {
    fn drop(&mut self) {
        self.controller.stop();
    }
}
