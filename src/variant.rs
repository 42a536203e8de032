//! Server configuration variants and `KEY=VALUE` environment lists.
//!
//! A variant spec is a `;`-separated list of entries:
//!
//! ```text
//! label
//! label::<args>
//! label::env:<K=V,...>
//! label::env:<K=V,...>::<args>
//! ```
//!
//! The first `::` ends the label. If what follows starts with `env:`, the next `::` ends
//! the environment list and everything after it is the argument string. Otherwise the
//! whole remainder, including any further `::`, is the argument string.
use std::{collections::BTreeMap, fmt};

use crate::error::VariantError;

const SEGMENT_DELIMITER: &str = "::";
const ENV_PREFIX: &str = "env:";

/// One configuration of the server under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub label: String,
    pub args: String,
    pub env: BTreeMap<String, String>,
}

impl Variant {
    pub fn new(label: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            args: args.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Environment overrides rendered back to `K=V,K2=V2`.
    pub fn env_csv(&self) -> String {
        format_env_csv(&self.env)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;
        if !self.env.is_empty() {
            write!(f, "{SEGMENT_DELIMITER}{ENV_PREFIX}{}", self.env_csv())?;
        }
        if !self.args.is_empty() || !self.env.is_empty() {
            write!(f, "{SEGMENT_DELIMITER}{}", self.args)?;
        }
        Ok(())
    }
}

/// Parses a `;`-separated variant spec. Blank entries are skipped.
pub fn parse_variants(spec: &str) -> Result<Vec<Variant>, VariantError> {
    spec.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

/// Variants for a run: the parsed spec, or a single `base` variant carrying `default_args`.
pub fn variants_or_default(
    spec: Option<&str>,
    default_args: &str,
) -> Result<Vec<Variant>, VariantError> {
    match spec.map(str::trim).filter(|spec| !spec.is_empty()) {
        Some(spec) => parse_variants(spec),
        None => Ok(vec![Variant::new("base", default_args.trim())]),
    }
}

fn parse_entry(entry: &str) -> Result<Variant, VariantError> {
    let (label, rest) = match entry.split_once(SEGMENT_DELIMITER) {
        Some((label, rest)) => (label.trim(), Some(rest)),
        None => (entry.trim(), None),
    };

    if label.is_empty() {
        return Err(VariantError::EmptyLabel(entry.to_string()));
    }

    let Some(rest) = rest else {
        return Ok(Variant::new(label, ""));
    };

    let Some(env_part) = rest.trim_start().strip_prefix(ENV_PREFIX) else {
        return Ok(Variant::new(label, rest.trim()));
    };

    let (csv, args) = env_part
        .split_once(SEGMENT_DELIMITER)
        .unwrap_or((env_part, ""));

    Ok(Variant::new(label, args.trim()).with_env(parse_env_csv(csv)?))
}

/// Parses `K=V,K2=V2`. Keys and values are trimmed; empty items are skipped.
pub fn parse_env_csv(csv: &str) -> Result<BTreeMap<String, String>, VariantError> {
    let mut env = BTreeMap::new();
    for item in csv.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| VariantError::InvalidEnvItem(item.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(VariantError::InvalidEnvItem(item.to_string()));
        }
        env.insert(key.to_string(), value.trim().to_string());
    }
    Ok(env)
}

pub fn format_env_csv(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
