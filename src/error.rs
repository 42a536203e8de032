//! Error handling for servebench.
use std::time::Duration;

use thiserror::Error;

/// Crate-level error returned by the drivers and the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Variant(#[from] VariantError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An evaluation results file could not be interpreted.
    #[error("Could not read results '{path}': {reason}")]
    Results {
        /// Path of the results file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Errors raised by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A live process is already registered under this name.
    #[error("Process '{name}' is already running")]
    AlreadyRunning {
        /// The logical process name.
        name: String,
    },

    /// The command line was empty.
    #[error("Empty command for process '{name}'")]
    EmptyCommand {
        /// The logical process name.
        name: String,
    },

    /// Error spawning a process.
    #[error("Failed to start process '{name}': {source}")]
    SpawnError {
        /// The logical process name.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error while waiting on a running process.
    #[error("Failed while waiting on process '{name}': {source}")]
    WaitError {
        /// The logical process name.
        name: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A synchronous run exceeded its timeout and was killed.
    #[error("Process '{name}' timed out after {timeout:?}")]
    Timeout {
        /// The logical process name.
        name: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A synchronous run was torn down by cleanup before it finished.
    #[error("Process '{name}' was interrupted by shutdown")]
    Interrupted {
        /// The logical process name.
        name: String,
    },

    /// Error opening the log channel a process writes to.
    #[error("Log channel error: {0}")]
    Log(#[from] LogError),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}

/// Errors raised by the log sink.
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error on a log file.
    #[error("Log file '{path}' unavailable: {source}")]
    Io {
        /// Path of the log file.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A search pattern did not compile.
    #[error("Invalid log pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The regex compilation error.
        #[source]
        source: regex::Error,
    },
}

/// Errors raised by the server lifecycle controller.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called while a session is starting or ready.
    #[error("Server is already running")]
    AlreadyRunning,

    /// `wait_for_ready` was called without a started session.
    #[error("Server was not started")]
    NotStarted,

    /// The server process exited before it became ready.
    #[error("Server process died unexpectedly\n\nLast lines of server log:\n{tail}")]
    ProcessDied {
        /// Last lines of the server log.
        tail: String,
    },

    /// A fatal pattern showed up in the server log.
    #[error(
        "Fatal error detected in server logs:\n  Pattern: {pattern}\n  Line: {line}\n\nLast lines of server log:\n{tail}"
    )]
    FatalLog {
        /// The pattern that matched.
        pattern: String,
        /// The matching log line.
        line: String,
        /// Last lines of the server log.
        tail: String,
    },

    /// The launch argument string could not be split into words.
    #[error("Invalid server arguments '{args}': {reason}")]
    InvalidArgs {
        /// The raw argument string.
        args: String,
        /// Why splitting failed.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("Failed to build health check client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Variant(#[from] VariantError),
}

/// Errors raised by git and build steps.
#[derive(Debug, Error)]
pub enum GitError {
    /// The directory does not contain a repository.
    #[error("Not a git repository: {0}")]
    NotARepository(String),

    /// A git or build command exited with failure.
    #[error("Command failed: {command}\nError: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// The command could not be spawned.
    #[error("Failed to run '{command}': {source}")]
    Spawn {
        /// The command line that was run.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while parsing variant and environment specs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariantError {
    /// A variant entry has no label.
    #[error("Variant entry '{0}' has an empty label")]
    EmptyLabel(String),

    /// An environment item is not `KEY=VALUE`.
    #[error("Invalid environment item '{0}' (expected KEY=VALUE)")]
    InvalidEnvItem(String),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A referenced environment variable is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A value could not be interpreted.
    #[error("Invalid value for '{field}': {value}")]
    InvalidValue {
        /// The field name.
        field: &'static str,
        /// The raw value.
        value: String,
    },
}
