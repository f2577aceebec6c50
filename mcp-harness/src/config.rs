//! Configuration for a harness run

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::TransportKind;
use crate::{
    HarnessError, HarnessResult, DEFAULT_CALL_TIMEOUT_SECONDS, DEFAULT_PROTOCOL_VERSION,
    DEFAULT_RETRIES, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_TARGET_DEADLINE_SECONDS, DEFAULT_WORKERS,
};

/// Configuration for a harness run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Run-wide settings
    #[serde(default)]
    pub run: RunSettings,

    /// Targets to validate, in the order they are reported
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Run-wide settings shared by every target pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Maximum number of target passes running at once
    pub workers: usize,

    /// Timeout for one send/receive, in milliseconds
    pub call_timeout_ms: u64,

    /// Deadline for one target's whole call sequence, in milliseconds
    pub target_deadline_ms: u64,

    /// Retries for transport-level failures
    pub retries: u32,

    /// Linear backoff step between retries, in milliseconds
    pub retry_backoff_ms: u64,

    /// Upper bound on `tools/list` pages followed via `nextCursor`
    pub max_list_pages: usize,

    /// Protocol version offered in `initialize`
    pub protocol_version: String,

    /// Directory receiving the run's artifacts
    pub output_dir: PathBuf,
}

/// One target entry as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique target name
    pub name: String,

    /// Base address of the target
    pub url: String,

    /// Transport binding to use
    #[serde(default)]
    pub transport: TransportKind,

    /// Name of the environment variable holding the bearer token
    #[serde(default)]
    pub credential_env: Option<String>,

    /// Endpoint path override, joined onto `url`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Explicit smoke-test call
    #[serde(default)]
    pub smoke_test: Option<SmokeTestConfig>,
}

/// Explicit smoke-test call for a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmokeTestConfig {
    /// Tool to invoke
    pub tool: String,

    /// Arguments object passed to the tool
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_SECONDS * 1000,
            target_deadline_ms: DEFAULT_TARGET_DEADLINE_SECONDS * 1000,
            retries: DEFAULT_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_list_pages: 16,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            output_dir: PathBuf::from("harness-reports"),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file, or YAML when the extension says so.
    ///
    /// Environment overrides are applied before validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> HarnessResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );

        let mut config: Self = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| {
                HarnessError::configuration(format!("Failed to parse config file: {}", e))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                HarnessError::configuration(format!("Failed to parse config file: {}", e))
            })?
        };

        config.run.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Default run settings with environment overrides and no targets
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self::default();
        config.run.apply_env_overrides()?;
        config.run.validate()?;
        Ok(config)
    }

    /// Validate run settings and every target entry
    pub fn validate(&self) -> HarnessResult<()> {
        self.run.validate()?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !seen.insert(target.name.as_str()) {
                return Err(HarnessError::DuplicateTarget {
                    name: target.name.clone(),
                });
            }
        }

        Ok(())
    }
}

impl RunSettings {
    /// Override settings from `MCP_HARNESS_*` environment variables
    pub fn apply_env_overrides(&mut self) -> HarnessResult<()> {
        if let Ok(workers) = std::env::var("MCP_HARNESS_WORKERS") {
            self.workers = workers.parse().map_err(|e| {
                HarnessError::configuration(format!("Invalid MCP_HARNESS_WORKERS: {}", e))
            })?;
        }

        if let Ok(timeout) = std::env::var("MCP_HARNESS_CALL_TIMEOUT") {
            self.call_timeout_ms = timeout.parse().map_err(|e| {
                HarnessError::configuration(format!("Invalid MCP_HARNESS_CALL_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(deadline) = std::env::var("MCP_HARNESS_TARGET_DEADLINE") {
            self.target_deadline_ms = deadline.parse().map_err(|e| {
                HarnessError::configuration(format!("Invalid MCP_HARNESS_TARGET_DEADLINE: {}", e))
            })?;
        }

        if let Ok(dir) = std::env::var("MCP_HARNESS_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }

        Ok(())
    }

    /// Validate run settings
    pub fn validate(&self) -> HarnessResult<()> {
        if self.workers == 0 {
            return Err(HarnessError::configuration(
                "Worker limit must be greater than 0",
            ));
        }

        if self.call_timeout_ms == 0 || self.target_deadline_ms == 0 {
            return Err(HarnessError::configuration(
                "Timeouts must be greater than 0",
            ));
        }

        if self.max_list_pages == 0 {
            return Err(HarnessError::configuration(
                "max_list_pages must be greater than 0",
            ));
        }

        if !crate::is_version_supported(&self.protocol_version) {
            return Err(HarnessError::configuration(format!(
                "Unsupported protocol version: {}",
                self.protocol_version
            )));
        }

        Ok(())
    }

    /// Per-call timeout as Duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Per-target deadline as Duration
    pub fn target_deadline(&self) -> Duration {
        Duration::from_millis(self.target_deadline_ms)
    }

    /// Backoff step as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl TargetConfig {
    /// Validate a single target entry
    pub fn validate(&self) -> HarnessResult<()> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::configuration("Target name must not be empty"));
        }

        crate::validate_target_url(&self.url)?;

        if let Some(ref endpoint) = self.endpoint {
            if !endpoint.starts_with('/') {
                return Err(HarnessError::configuration(format!(
                    "Endpoint for target '{}' must start with '/'",
                    self.name
                )));
            }
        }

        if let Some(ref smoke) = self.smoke_test {
            if smoke.tool.is_empty() {
                return Err(HarnessError::configuration(format!(
                    "Smoke test for target '{}' must name a tool",
                    self.name
                )));
            }
            if !smoke.arguments.is_object() {
                return Err(HarnessError::configuration(format!(
                    "Smoke test arguments for target '{}' must be a table/object",
                    self.name
                )));
            }
        }

        Ok(())
    }
}
