//! Run configuration.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "STACKFORM_";

/// How a run reacts to a failed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop starting new resources after the first failure (default).
    ///
    /// Resources already calling the engine finish; every resource not yet
    /// started is skipped with the failure as its cause.
    #[default]
    FailFast,
    /// Skip only the dependents of a failed resource.
    ContinueOnFailure,
}

impl FromStr for FailureMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "continue_on_failure" | "continue" => Ok(Self::ContinueOnFailure),
            "fail_fast" => Ok(Self::FailFast),
            _ => Err(ConfigError::invalid(
                "failure_mode",
                s,
                "expected 'continue_on_failure' or 'fail_fast'",
            )),
        }
    }
}

/// Logging setup used by [`init_tracing`](crate::observability::init_tracing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Settings for one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum engine calls in flight. Zero means unbounded.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Reaction to a failed resource.
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Per-call engine timeout in milliseconds.
    #[serde(default)]
    pub engine_timeout_ms: Option<u64>,
    /// How long to wait for caller-owned pending inputs.
    #[serde(default = "default_input_timeout_ms")]
    pub input_timeout_ms: u64,
    /// Logging setup.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_max_concurrency() -> usize {
    10
}

fn default_input_timeout_ms() -> u64 {
    60_000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            failure_mode: FailureMode::default(),
            engine_timeout_ms: None,
            input_timeout_ms: default_input_timeout_ms(),
            log: LogConfig::default(),
        }
    }
}

impl RunConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Parses configuration from a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from `STACKFORM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Builds configuration from `STACKFORM_*` entries of `vars`.
    ///
    /// Unrelated entries are ignored; unset settings keep their defaults.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|k| (k.to_string(), v)))
            .collect();

        let mut config = Self::default();
        if let Some(raw) = vars.get("MAX_CONCURRENCY") {
            config.max_concurrency = parse_number("max_concurrency", raw)?;
        }
        if let Some(raw) = vars.get("FAILURE_MODE") {
            config.failure_mode = raw.parse()?;
        }
        if let Some(raw) = vars.get("ENGINE_TIMEOUT_MS") {
            config.engine_timeout_ms = Some(parse_number("engine_timeout_ms", raw)?);
        }
        if let Some(raw) = vars.get("INPUT_TIMEOUT_MS") {
            config.input_timeout_ms = parse_number("input_timeout_ms", raw)?;
        }
        if let Some(raw) = vars.get("LOG_LEVEL") {
            config.log.level.clone_from(raw);
        }
        if let Some(raw) = vars.get("LOG_JSON") {
            config.log.json = matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("engine_timeout_ms", "0", "must be positive when set"));
        }
        if self.input_timeout_ms == 0 {
            return Err(ConfigError::invalid("input_timeout_ms", "0", "must be positive"));
        }
        if self.log.level.trim().is_empty() {
            return Err(ConfigError::invalid("log.level", "", "must not be empty"));
        }
        Ok(())
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Sets the engine call timeout.
    #[must_use]
    pub fn with_engine_timeout(mut self, timeout: Duration) -> Self {
        self.engine_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Sets the input wait timeout.
    #[must_use]
    pub fn with_input_timeout(mut self, timeout: Duration) -> Self {
        self.input_timeout_ms = duration_ms(timeout);
        self
    }

    /// Returns the engine timeout, if any.
    #[must_use]
    pub fn engine_timeout(&self) -> Option<Duration> {
        self.engine_timeout_ms.map(Duration::from_millis)
    }

    /// Returns the input wait timeout.
    #[must_use]
    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_number<N: FromStr>(key: &str, raw: &str) -> Result<N, ConfigError>
where
    N::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: N::Err| ConfigError::invalid(key, raw, e.to_string()))
}
