//! Run-plan configuration: an optional YAML file, command-line overrides, and defaults.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::ConfigError;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "servebench.yaml";

pub const DEFAULT_MODEL: &str = "meta-llama/Meta-Llama-3-8B-Instruct";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 3333;
pub const DEFAULT_RATES: &[f64] = &[1.0, 5.0, 10.0, 25.0, 100.0];

/// Values from the YAML file or the command line. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub model: Option<String>,
    /// Short model name used in result filenames.
    pub terse_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Virtualenv providing `vllm`, `python`, and `lm_eval`.
    pub venv: Option<PathBuf>,
    pub repo_dir: Option<PathBuf>,
    pub out_base: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Request rates in requests per second.
    pub rates: Option<Vec<f64>>,
    /// Seconds of load per rate.
    pub run_seconds: Option<u64>,
    pub dataset: Option<String>,
    pub random_in: Option<u32>,
    pub random_out: Option<u32>,
    pub random_range_ratio: Option<f64>,
    pub tensor_parallel_size: Option<u32>,
    /// Arguments added to every server launch.
    pub server_args_base: Option<String>,
    /// Variant spec shared by both sides of a comparison.
    pub variants: Option<String>,
    pub label_suffix: Option<String>,
    /// Seconds to wait for the server to become ready.
    pub ready_timeout: Option<u64>,
    /// Reservation wrapper; an empty string disables it.
    pub reservation_tool: Option<String>,
}

impl RunConfig {
    /// Fields set in `overrides` replace the ones in `self`.
    pub fn merge(self, overrides: RunConfig) -> RunConfig {
        RunConfig {
            model: overrides.model.or(self.model),
            terse_name: overrides.terse_name.or(self.terse_name),
            host: overrides.host.or(self.host),
            port: overrides.port.or(self.port),
            venv: overrides.venv.or(self.venv),
            repo_dir: overrides.repo_dir.or(self.repo_dir),
            out_base: overrides.out_base.or(self.out_base),
            log_dir: overrides.log_dir.or(self.log_dir),
            rates: overrides.rates.or(self.rates),
            run_seconds: overrides.run_seconds.or(self.run_seconds),
            dataset: overrides.dataset.or(self.dataset),
            random_in: overrides.random_in.or(self.random_in),
            random_out: overrides.random_out.or(self.random_out),
            random_range_ratio: overrides.random_range_ratio.or(self.random_range_ratio),
            tensor_parallel_size: overrides.tensor_parallel_size.or(self.tensor_parallel_size),
            server_args_base: overrides.server_args_base.or(self.server_args_base),
            variants: overrides.variants.or(self.variants),
            label_suffix: overrides.label_suffix.or(self.label_suffix),
            ready_timeout: overrides.ready_timeout.or(self.ready_timeout),
            reservation_tool: overrides.reservation_tool.or(self.reservation_tool),
        }
    }
}

/// Fully resolved settings shared by the drivers.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model: String,
    pub terse_name: String,
    pub host: String,
    pub port: u16,
    pub venv: PathBuf,
    pub repo_dir: PathBuf,
    pub out_base: PathBuf,
    pub log_dir: PathBuf,
    pub rates: Vec<f64>,
    pub run_seconds: u64,
    pub dataset: String,
    pub random_in: u32,
    pub random_out: u32,
    pub random_range_ratio: f64,
    pub tensor_parallel_size: u32,
    pub server_args_base: String,
    pub variants: Option<String>,
    pub label_suffix: String,
    pub ready_timeout: Duration,
    pub reservation_tool: Option<String>,
}

impl Settings {
    /// Fills unset fields with defaults. `default_out_base` differs per subcommand.
    pub fn resolve(config: RunConfig, default_out_base: &str) -> Result<Self, ConfigError> {
        let model = config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let terse_name = config
            .terse_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| terse_model_name(&model));

        let rates = config.rates.unwrap_or_else(|| DEFAULT_RATES.to_vec());
        if let Some(bad) = rates.iter().find(|rate| !rate.is_finite() || **rate <= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "rates",
                value: bad.to_string(),
            });
        }

        let run_seconds = config.run_seconds.unwrap_or(120);
        if run_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "run_seconds",
                value: "0".into(),
            });
        }

        let out_base = config
            .out_base
            .unwrap_or_else(|| PathBuf::from(default_out_base));
        let log_dir = config.log_dir.unwrap_or_else(|| out_base.join("logs"));

        Ok(Self {
            model,
            terse_name,
            host: config.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: config.port.unwrap_or(DEFAULT_PORT),
            venv: config.venv.unwrap_or_else(|| PathBuf::from(".venv")),
            repo_dir: config.repo_dir.unwrap_or_else(|| PathBuf::from(".")),
            out_base,
            log_dir,
            rates,
            run_seconds,
            dataset: config.dataset.unwrap_or_else(|| "random".to_string()),
            random_in: config.random_in.unwrap_or(1000),
            random_out: config.random_out.unwrap_or(100),
            random_range_ratio: config.random_range_ratio.unwrap_or(0.0),
            tensor_parallel_size: config.tensor_parallel_size.unwrap_or(1).max(1),
            server_args_base: config.server_args_base.unwrap_or_default(),
            variants: config.variants.filter(|spec| !spec.trim().is_empty()),
            label_suffix: config.label_suffix.unwrap_or_default(),
            ready_timeout: Duration::from_secs(config.ready_timeout.unwrap_or(600)),
            reservation_tool: match config.reservation_tool {
                Some(tool) if tool.trim().is_empty() => None,
                Some(tool) => Some(tool),
                None => Some("chg".to_string()),
            },
        })
    }

    /// Environment overrides that activate the virtualenv for child processes.
    ///
    /// Empty when the virtualenv directory does not exist.
    pub fn venv_env(&self) -> BTreeMap<String, String> {
        let mut overrides = BTreeMap::new();
        if !self.venv.is_dir() {
            return overrides;
        }

        let venv = self.venv.canonicalize().unwrap_or_else(|_| self.venv.clone());
        let bin = venv.join("bin").display().to_string();
        let current = env::var("PATH").unwrap_or_default();
        let path = if current.split(':').any(|entry| entry == bin) {
            current
        } else if current.is_empty() {
            bin
        } else {
            format!("{bin}:{current}")
        };

        overrides.insert("PATH".to_string(), path);
        overrides.insert("VIRTUAL_ENV".to_string(), venv.display().to_string());
        overrides
    }

    /// `<venv>/bin/<tool>` when present, the bare tool name otherwise.
    pub fn venv_tool(&self, tool: &str) -> String {
        let candidate = self.venv.join("bin").join(tool);
        if candidate.exists() {
            candidate.display().to_string()
        } else {
            tool.to_string()
        }
    }
}

/// Last path component of a model id, e.g. `Meta-Llama-3-8B-Instruct`.
pub fn terse_model_name(model: &str) -> String {
    Path::new(model.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| model.replace('/', "_"))
}

/// Parses a comma-separated list of request rates.
pub fn parse_rates(csv: &str) -> Result<Vec<f64>, ConfigError> {
    csv.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<f64>()
                .ok()
                .filter(|rate| rate.is_finite() && *rate > 0.0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "rates",
                    value: item.to_string(),
                })
        })
        .collect()
}

/// Expands `$VAR` and `${VAR}` references. Unset variables are an error.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();
    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingEnvVar(var_name)),
        None => Ok(result.to_string()),
    }
}

/// Loads the YAML run plan at `config_path`, or `servebench.yaml` when present.
///
/// Without either, returns an empty [`RunConfig`].
pub fn load_config(config_path: Option<&Path>) -> Result<RunConfig, ConfigError> {
    let config_path = match config_path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Path::new(DEFAULT_CONFIG_FILE),
        None => return Ok(RunConfig::default()),
    };

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    if expanded_content.trim().is_empty() {
        return Ok(RunConfig::default());
    }

    Ok(serde_yaml::from_str(&expanded_content)?)
}
