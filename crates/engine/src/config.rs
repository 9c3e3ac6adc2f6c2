//! Engine configuration: loop concurrency, pagination ceilings, sandbox budgets and timeouts.
//!
//! Values come from an optional JSON or YAML file and are then overridden by `TOOLFLOW_*`
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::sandbox::SandboxLimits;

pub const LOOP_CONCURRENCY_ENV: &str = "TOOLFLOW_LOOP_CONCURRENCY";
pub const MAX_PAGES_ENV: &str = "TOOLFLOW_MAX_PAGES";
pub const SANDBOX_TIMEOUT_ENV: &str = "TOOLFLOW_SANDBOX_TIMEOUT_MS";
pub const RUN_TIMEOUT_ENV: &str = "TOOLFLOW_RUN_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid configuration for '{field}': {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "CONFIG_READ_FAILED",
            ConfigError::Parse { .. } => "CONFIG_PARSE_FAILED",
            ConfigError::InvalidEnv { .. } => "CONFIG_ENV_INVALID",
            ConfigError::Invalid { .. } => "CONFIG_INVALID",
        }
    }

    pub fn diagnostic(&self) -> Value {
        let (context, suggested_action) = match self {
            ConfigError::Io { path, .. } => (json!({ "path": path }), "Provide a readable configuration file path."),
            ConfigError::Parse { path, .. } => (json!({ "path": path }), "Fix the JSON or YAML syntax of the configuration file."),
            ConfigError::InvalidEnv { name, value } => (
                json!({ "name": name, "value": value }),
                "Set the variable to a positive integer or unset it.",
            ),
            ConfigError::Invalid { field, .. } => (json!({ "field": field }), "Use a value greater than zero."),
        };
        json!({
            "error_code": self.error_code(),
            "category": "configuration",
            "message": self.to_string(),
            "context": context,
            "suggested_action": suggested_action,
        })
    }
}

/// Sandbox budgets as they appear in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_steps: u64,
    pub timeout_ms: u64,
    pub max_call_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            timeout_ms: 1_000,
            max_call_depth: 64,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_steps: self.max_steps,
            timeout: Duration::from_millis(self.timeout_ms),
            max_call_depth: self.max_call_depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running loop iterations. `1` runs them sequentially.
    pub loop_concurrency: usize,
    /// Hard ceiling on pages fetched by one pagination sub-loop.
    pub max_pages: u32,
    /// Page size used when a pagination config does not declare one.
    pub default_page_size: u32,
    pub sandbox: SandboxConfig,
    /// Wall-clock budget for a whole run.
    pub run_timeout_ms: Option<u64>,
    pub http_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_concurrency: 1,
            max_pages: 100,
            default_page_size: 50,
            sandbox: SandboxConfig::default(),
            run_timeout_ms: None,
            http_timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Loads a config file (JSON when the extension is `.json`, YAML otherwise) and applies
    /// environment overrides.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str::<EngineConfig>(&content).map_err(|error| error.to_string())
        } else if content.trim().is_empty() {
            Ok(EngineConfig::default())
        } else {
            serde_yaml::from_str::<EngineConfig>(&content).map_err(|error| error.to_string())
        };
        let config = parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        config.with_env_overrides()
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        EngineConfig::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(value) = read_env_number(LOOP_CONCURRENCY_ENV)? {
            self.loop_concurrency = usize::try_from(value).map_err(|_| invalid_env(LOOP_CONCURRENCY_ENV, value))?;
        }
        if let Some(value) = read_env_number(MAX_PAGES_ENV)? {
            self.max_pages = u32::try_from(value).map_err(|_| invalid_env(MAX_PAGES_ENV, value))?;
        }
        if let Some(value) = read_env_number(SANDBOX_TIMEOUT_ENV)? {
            self.sandbox.timeout_ms = value;
        }
        if let Some(value) = read_env_number(RUN_TIMEOUT_ENV)? {
            self.run_timeout_ms = Some(value);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 6] = [
            ("loop_concurrency", self.loop_concurrency as u64),
            ("max_pages", u64::from(self.max_pages)),
            ("default_page_size", u64::from(self.default_page_size)),
            ("sandbox.max_steps", self.sandbox.max_steps),
            ("sandbox.timeout_ms", self.sandbox.timeout_ms),
            ("sandbox.max_call_depth", self.sandbox.max_call_depth as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.run_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "run_timeout_ms",
                message: "must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        self.sandbox.limits()
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn read_env_number(name: &'static str) -> Result<Option<u64>, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { name, value: raw.clone() })
}

fn invalid_env(name: &'static str, value: u64) -> ConfigError {
    ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ENV: [&str; 4] = [LOOP_CONCURRENCY_ENV, MAX_PAGES_ENV, SANDBOX_TIMEOUT_ENV, RUN_TIMEOUT_ENV];

    fn without_env<F: FnOnce()>(f: F) {
        temp_env::with_vars_unset(ALL_ENV, f);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.loop_concurrency, 1);
        assert_eq!(config.max_pages, 100);
        assert_eq!(config.default_page_size, 50);
        assert_eq!(config.sandbox_limits(), SandboxLimits::default());
        assert_eq!(config.run_timeout(), None);
        assert_eq!(config.http_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn loads_yaml_and_json_files() {
        without_env(|| {
            let dir = tempfile::tempdir().expect("tempdir");
            let yaml_path = dir.path().join("engine.yaml");
            fs::write(&yaml_path, "loop_concurrency: 4\nsandbox:\n  timeout_ms: 250\n").expect("write yaml");
            let config = EngineConfig::load_from_path(&yaml_path).expect("yaml config");
            assert_eq!(config.loop_concurrency, 4);
            assert_eq!(config.sandbox.timeout_ms, 250);
            assert_eq!(config.sandbox.max_steps, 1_000_000);

            let json_path = dir.path().join("engine.json");
            fs::write(&json_path, r#"{"max_pages": 7, "run_timeout_ms": 5000}"#).expect("write json");
            let config = EngineConfig::load_from_path(&json_path).expect("json config");
            assert_eq!(config.max_pages, 7);
            assert_eq!(config.run_timeout(), Some(Duration::from_millis(5000)));
        });
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "loop_concurrency: 4\nmax_pages: 10\n").expect("write");
        temp_env::with_vars(
            [
                (LOOP_CONCURRENCY_ENV, Some("8")),
                (MAX_PAGES_ENV, None),
                (SANDBOX_TIMEOUT_ENV, Some("20")),
                (RUN_TIMEOUT_ENV, Some("1500")),
            ],
            || {
                let config = EngineConfig::load_from_path(&path).expect("config");
                assert_eq!(config.loop_concurrency, 8);
                assert_eq!(config.max_pages, 10);
                assert_eq!(config.sandbox.timeout_ms, 20);
                assert_eq!(config.run_timeout_ms, Some(1500));
            },
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        temp_env::with_vars(
            [
                (LOOP_CONCURRENCY_ENV, Some("many")),
                (MAX_PAGES_ENV, None),
                (SANDBOX_TIMEOUT_ENV, None),
                (RUN_TIMEOUT_ENV, None),
            ],
            || {
                let error = EngineConfig::from_env().expect_err("invalid env");
                assert!(matches!(error, ConfigError::InvalidEnv { name: LOOP_CONCURRENCY_ENV, .. }));
                assert_eq!(error.diagnostic()["error_code"], "CONFIG_ENV_INVALID");
            },
        );

        without_env(|| {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("engine.json");
            fs::write(&path, r#"{"loop_concurrency": 0}"#).expect("write");
            let error = EngineConfig::load_from_path(&path).expect_err("zero concurrency");
            assert!(matches!(error, ConfigError::Invalid { field: "loop_concurrency", .. }));

            fs::write(&path, "{not json").expect("write");
            assert!(matches!(EngineConfig::load_from_path(&path), Err(ConfigError::Parse { .. })));
        });
    }
}
