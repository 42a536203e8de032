//! Supervision of named child processes.
//!
//! Every child is started in its own session, so its process group id equals its pid
//! and signals sent to the group reach everything it forks without touching us.
use std::{
    collections::{BTreeMap, HashMap},
    io::Read,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{Pid, getpgrp},
};
use tracing::{debug, error, info, warn};

use crate::{error::SupervisorError, logs::LogSink};

/// How often a blocked caller re-checks a child for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a child's stdout and stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputRouting {
    /// Both streams go to `/dev/null`.
    #[default]
    Discard,
    /// Both streams are collected in memory and returned by [`ProcessSupervisor::run`].
    Capture,
    /// Both streams are appended, interleaved, to the named log channel.
    Log(String),
    /// Both streams are shared with the supervising process.
    Inherit,
}

/// A command line with its environment overrides and working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessCommand {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Working directory; inherited when unset.
    pub cwd: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Space-joined command line, for logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a synchronous [`ProcessSupervisor::run`].
///
/// A non-zero exit is not an error; callers inspect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
    /// Signal number if the process was killed by a signal.
    pub signal: Option<i32>,
    /// Captured stdout (only with [`OutputRouting::Capture`]).
    pub stdout: String,
    /// Captured stderr (only with [`OutputRouting::Capture`]).
    pub stderr: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Shell-style exit code: the code itself, or 128 + signal.
    pub fn code(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

/// Wait bounds for the interrupt, terminate and kill stages of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Wait after SIGINT.
    pub interrupt_wait: Duration,
    /// Wait after SIGTERM.
    pub terminate_wait: Duration,
    /// Wait after SIGKILL; the process is considered gone afterwards either way.
    pub kill_wait: Duration,
    /// Pause after [`ProcessSupervisor::terminate_all`] stopped anything.
    pub settle: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            interrupt_wait: Duration::from_secs(5),
            terminate_wait: Duration::from_secs(3),
            kill_wait: Duration::from_secs(2),
            settle: Duration::from_secs(1),
        }
    }
}

/// A child process registered under a logical name.
#[derive(Debug)]
struct ManagedProcess {
    child: Child,
    pid: u32,
    pgid: i32,
}

impl ManagedProcess {
    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

#[derive(Debug)]
struct Registry {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    logs: LogSink,
    policy: ShutdownPolicy,
}

impl Registry {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ManagedProcess>>, SupervisorError> {
        Ok(self.processes.lock()?)
    }

    /// Lock that survives poisoning; cleanup must run even after a panic elsewhere.
    fn lock_for_cleanup(&self) -> MutexGuard<'_, HashMap<String, ManagedProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn terminate(&self, name: &str, policy: &ShutdownPolicy) -> bool {
        // Taking the entry out first makes concurrent callers see "already gone".
        let Some(mut process) = self.lock_for_cleanup().remove(name) else {
            return false;
        };

        if !process.is_alive() {
            debug!("Process '{name}' (PID {}) had already exited", process.pid);
            kill_leftovers(name, process.pgid);
            return false;
        }

        info!("Terminating {name} (PID {})...", process.pid);

        let stages = [
            (Signal::SIGINT, policy.interrupt_wait),
            (Signal::SIGTERM, policy.terminate_wait),
            (Signal::SIGKILL, policy.kill_wait),
        ];

        for (sig, wait) in stages {
            signal_group(name, process.pgid, process.pid, sig);
            if wait_for_exit(&mut process.child, wait) {
                info!("{name} terminated with {sig}");
                return true;
            }
            debug!("{name} still alive {wait:?} after {sig}");
        }

        warn!(
            "Could not confirm exit of '{name}' (PID {}) after SIGKILL; giving up",
            process.pid
        );
        true
    }

    fn terminate_all(&self) {
        let names: Vec<String> = self.lock_for_cleanup().keys().cloned().collect();
        if names.is_empty() {
            return;
        }

        info!("Terminating all processes...");
        let mut stopped_any = false;
        for name in names {
            stopped_any |= self.terminate(&name, &self.policy);
        }

        if stopped_any {
            thread::sleep(self.policy.settle);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

/// Owns every child process started through it.
///
/// Cloning is cheap and every clone shares one registry, so a clone can be handed to a
/// signal handler. When the last clone is dropped, remaining children are terminated.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    registry: Arc<Registry>,
}

impl ProcessSupervisor {
    /// Creates a supervisor routing logged output into `logs`.
    pub fn new(logs: LogSink) -> Self {
        Self::with_policy(logs, ShutdownPolicy::default())
    }

    pub fn with_policy(logs: LogSink, policy: ShutdownPolicy) -> Self {
        Self {
            registry: Arc::new(Registry {
                processes: Mutex::new(HashMap::new()),
                logs,
                policy,
            }),
        }
    }

    pub fn logs(&self) -> &LogSink {
        &self.registry.logs
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.registry.policy
    }

    /// Runs `command` to completion under `name`.
    ///
    /// The child is registered while it runs so that [`ProcessSupervisor::terminate_all`]
    /// reaches it. On timeout its whole process group is killed and
    /// [`SupervisorError::Timeout`] is returned.
    pub fn run(
        &self,
        name: &str,
        command: &ProcessCommand,
        timeout: Option<Duration>,
        routing: OutputRouting,
    ) -> Result<RunOutcome, SupervisorError> {
        info!("Running {name}: {}", command.display());

        let readers = {
            let mut processes = self.registry.lock()?;
            ensure_vacant(&mut processes, name)?;
            let mut process = self.spawn(name, command, &routing)?;
            let readers = take_capture(&mut process.child);
            processes.insert(name.to_string(), process);
            readers
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let (status, pgid) = loop {
            {
                let mut processes = self.registry.lock()?;
                let Some(process) = processes.get_mut(name) else {
                    warn!("{name} was torn down before it finished");
                    return Err(SupervisorError::Interrupted {
                        name: name.to_string(),
                    });
                };

                match process.child.try_wait() {
                    Ok(Some(status)) => {
                        let pgid = process.pgid;
                        processes.remove(name);
                        break (status, pgid);
                    }
                    Ok(None) => {}
                    Err(source) => {
                        let removed = processes.remove(name);
                        drop(processes);
                        if let Some(process) = removed {
                            kill_now(name, process);
                        }
                        return Err(SupervisorError::WaitError {
                            name: name.to_string(),
                            source,
                        });
                    }
                }

                if let (Some(deadline), Some(timeout)) = (deadline, timeout)
                    && Instant::now() >= deadline
                {
                    warn!("{name} timed out after {timeout:?}; killing process group");
                    let removed = processes.remove(name);
                    drop(processes);
                    if let Some(process) = removed {
                        kill_now(name, process);
                    }
                    return Err(SupervisorError::Timeout {
                        name: name.to_string(),
                        timeout,
                    });
                }
            }

            thread::sleep(WAIT_POLL_INTERVAL);
        };

        // Members that outlive the leader still hold the capture pipes.
        kill_leftovers(name, pgid);
        let Some((stdout, stderr)) = readers.join_until(deadline) else {
            warn!("{name} output did not close before the deadline");
            return Err(SupervisorError::Timeout {
                name: name.to_string(),
                timeout: timeout.unwrap_or_default(),
            });
        };
        let outcome = RunOutcome {
            exit_code: status.code(),
            signal: status.signal(),
            stdout,
            stderr,
        };

        if outcome.success() {
            info!("{name} completed successfully");
        } else {
            info!("{name} {}", describe_status(&status));
        }

        Ok(outcome)
    }

    /// Starts `command` detached into its own session and registers it under `name`.
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] if a live process already holds
    /// the name; a stale, exited entry is replaced.
    pub fn run_background(
        &self,
        name: &str,
        command: &ProcessCommand,
        routing: OutputRouting,
    ) -> Result<u32, SupervisorError> {
        info!("Starting background process {name}: {}", command.display());

        let routing = if routing == OutputRouting::Capture {
            warn!("Output capture is not supported for background process '{name}'; discarding");
            OutputRouting::Discard
        } else {
            routing
        };

        let mut processes = self.registry.lock()?;
        ensure_vacant(&mut processes, name)?;
        let process = self.spawn(name, command, &routing)?;
        let pid = process.pid;
        processes.insert(name.to_string(), process);

        info!("Started {name} with PID {pid}");
        Ok(pid)
    }

    /// Whether `name` is registered and still running. Never blocks.
    pub fn is_alive(&self, name: &str) -> bool {
        self.registry
            .lock_for_cleanup()
            .get_mut(name)
            .is_some_and(ManagedProcess::is_alive)
    }

    /// PID of the process registered under `name`.
    pub fn pid(&self, name: &str) -> Option<u32> {
        self.registry
            .lock_for_cleanup()
            .get(name)
            .map(|process| process.pid)
    }

    /// Names currently registered, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.lock_for_cleanup().keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops `name` by signalling its process group with SIGINT, then SIGTERM, then
    /// SIGKILL, waiting the policy's bound after each.
    ///
    /// The entry is always removed. Returns whether the process was alive when called;
    /// calling it again, or for an unknown name, returns `false`.
    pub fn terminate(&self, name: &str) -> bool {
        self.registry.terminate(name, &self.registry.policy)
    }

    /// [`ProcessSupervisor::terminate`] with a custom wait after the interrupt stage.
    pub fn terminate_with_grace(&self, name: &str, grace: Duration) -> bool {
        let policy = ShutdownPolicy {
            interrupt_wait: grace,
            ..self.registry.policy
        };
        self.registry.terminate(name, &policy)
    }

    /// Terminates every registered process. Safe to call repeatedly and concurrently.
    pub fn terminate_all(&self) {
        self.registry.terminate_all();
    }

    fn spawn(
        &self,
        name: &str,
        command: &ProcessCommand,
        routing: &OutputRouting,
    ) -> Result<ManagedProcess, SupervisorError> {
        let Some((program, args)) = command.argv.split_first() else {
            return Err(SupervisorError::EmptyCommand {
                name: name.to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        if !command.env.is_empty() {
            let keys: Vec<_> = command.env.keys().collect();
            debug!("Setting environment variables: {:?}", keys);
            cmd.envs(&command.env);
        }

        let (stdout, stderr) = self.stdio_for(routing)?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

        unsafe {
            cmd.pre_exec(|| {
                // New session: the child leads its own process group, so group signals
                // sent to it never reach the supervisor.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| {
            error!("Failed to start process '{name}': {source}");
            SupervisorError::SpawnError {
                name: name.to_string(),
                source,
            }
        })?;

        let pid = child.id();
        debug!("Process '{name}' started with PID: {pid}");
        Ok(ManagedProcess {
            child,
            pid,
            pgid: pid as i32,
        })
    }

    fn stdio_for(&self, routing: &OutputRouting) -> Result<(Stdio, Stdio), SupervisorError> {
        Ok(match routing {
            OutputRouting::Discard => (Stdio::null(), Stdio::null()),
            OutputRouting::Capture => (Stdio::piped(), Stdio::piped()),
            OutputRouting::Inherit => (Stdio::inherit(), Stdio::inherit()),
            OutputRouting::Log(channel) => {
                let file = self.registry.logs.open_append(channel)?;
                let err_file = file.try_clone().map_err(|source| {
                    SupervisorError::Log(crate::error::LogError::Io {
                        path: self.registry.logs.path(channel).display().to_string(),
                        source,
                    })
                })?;
                (Stdio::from(file), Stdio::from(err_file))
            }
        })
    }
}

/// Fails if a live process holds `name`; drops a stale entry otherwise.
fn ensure_vacant(
    processes: &mut HashMap<String, ManagedProcess>,
    name: &str,
) -> Result<(), SupervisorError> {
    if let Some(existing) = processes.get_mut(name) {
        if existing.is_alive() {
            return Err(SupervisorError::AlreadyRunning {
                name: name.to_string(),
            });
        }
        debug!("Replacing exited process entry '{name}'");
        processes.remove(name);
    }
    Ok(())
}

/// Reader threads draining captured pipes so the child never blocks on a full pipe.
struct CaptureReaders {
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl CaptureReaders {
    /// Collects both streams, or `None` if a pipe is still open at `deadline`.
    ///
    /// Reader threads left behind finish on their own once the pipe closes.
    fn join_until(self, deadline: Option<Instant>) -> Option<(String, String)> {
        let pending = |handle: &Option<JoinHandle<String>>| {
            handle.as_ref().is_some_and(|handle| !handle.is_finished())
        };
        while pending(&self.stdout) || pending(&self.stderr) {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return None;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }

        let collect = |handle: Option<JoinHandle<String>>| {
            handle
                .and_then(|handle| handle.join().ok())
                .unwrap_or_default()
        };
        Some((collect(self.stdout), collect(self.stderr)))
    }
}

fn take_capture(child: &mut Child) -> CaptureReaders {
    fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    }

    CaptureReaders {
        stdout: child.stdout.take().map(drain),
        stderr: child.stderr.take().map(drain),
    }
}

/// Sends `sig` to the process group, falling back to the leader if the group is ours.
///
/// A process that is already gone (`ESRCH`) or not ours to signal (`EPERM`) is expected
/// when racing its exit and is not reported.
fn signal_group(name: &str, pgid: i32, pid: u32, sig: Signal) {
    let result = if Pid::from_raw(pgid) == getpgrp() {
        warn!("'{name}' shares our process group; signalling PID {pid} only");
        signal::kill(Pid::from_raw(pid as i32), sig)
    } else {
        signal::killpg(Pid::from_raw(pgid), sig)
    };

    match result {
        Ok(()) => debug!("Sent {sig} to process group {pgid} ('{name}')"),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {
            debug!("Process group {pgid} ('{name}') already gone while sending {sig}")
        }
        Err(err) => warn!("Failed to send {sig} to process group {pgid} ('{name}'): {err}"),
    }
}

/// SIGKILLs whatever is left of a group whose leader has exited.
fn kill_leftovers(name: &str, pgid: i32) {
    if Pid::from_raw(pgid) == getpgrp() {
        return;
    }

    match signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => info!("Killed leftover members of process group {pgid} ('{name}')"),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(err) => warn!("Failed to clear process group {pgid} ('{name}'): {err}"),
    }
}

/// Waits up to `timeout` for `child` to exit. `true` once it has (or cannot be waited on).
fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return true,
            Ok(None) => {
                if Instant::now() >= deadline {
                    return false;
                }
                thread::sleep(WAIT_POLL_INTERVAL.min(timeout));
            }
        }
    }
}

/// Immediate group kill used for timed-out synchronous runs.
fn kill_now(name: &str, mut process: ManagedProcess) {
    signal_group(name, process.pgid, process.pid, Signal::SIGKILL);
    if !wait_for_exit(&mut process.child, ShutdownPolicy::default().kill_wait) {
        warn!("Could not confirm exit of '{name}' (PID {}) after SIGKILL", process.pid);
    }
}

/// Describes an exit status for logs.
fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with status {code}"),
        (None, Some(sig)) => format!("killed by signal {sig}"),
        (None, None) => format!("terminated unexpectedly: {status:?}"),
    }
}
