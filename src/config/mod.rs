//! Configuration module
//!
//! Handles loading, validating and layering configuration. File values are
//! overridden by environment variables, which are overridden by CLI flags.

mod env;

pub use env::{print_env_help, EnvConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal configuration problems, raised before any batch is dispatched
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No app list found: {0}")]
    MissingApps(String),

    #[error("App list is empty")]
    EmptyApps,

    #[error("Failed to parse {name} as an integer: {value:?}")]
    InvalidInteger { name: &'static str, value: String },

    #[error("Worker count must be at least 1")]
    ZeroWorkerCount,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// File holding the app names, one per line
    pub apps_file: PathBuf,

    /// Inline app list; takes precedence over the file when set
    pub apps: Option<String>,

    /// Maximum concurrent batches; defaults to available parallelism
    pub concurrency: Option<usize>,

    /// Fixed RNG seed for reproducible shuffles and delays
    pub seed: Option<u64>,

    /// Run against the local emulator instead of a provisioned instance
    pub use_emulator: bool,

    pub scheduler: SchedulerConfig,
    pub throttle: ThrottleConfig,
    pub runner: RunnerConfig,
    pub emulator: EmulatorConfig,
    pub spanner: SpannerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            apps_file: PathBuf::from("django_test_apps.txt"),
            apps: None,
            concurrency: None,
            seed: None,
            use_emulator: false,
            scheduler: SchedulerConfig::default(),
            throttle: ThrottleConfig::default(),
            runner: RunnerConfig::default(),
            emulator: EmulatorConfig::default(),
            spanner: SpannerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject knob values that would stall or break the scheduler
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == Some(0) {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.scheduler.apps_per_worker_factor == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.apps_per_worker_factor must be at least 1".into(),
            ));
        }
        if self.scheduler.fallback_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.fallback_batch_size must be at least 1".into(),
            ));
        }
        if self.throttle.max_requests_per_window == 0 {
            return Err(ConfigError::Invalid(
                "throttle.max_requests_per_window must be at least 1".into(),
            ));
        }
        if self.runner.command.is_empty() {
            return Err(ConfigError::Invalid("runner.command is empty".into()));
        }
        if self.spanner.access_token.is_none() && self.spanner.token_command.is_empty() {
            return Err(ConfigError::Invalid(
                "spanner.token_command is empty and no access token is set".into(),
            ));
        }
        if self.runner.apps_env.is_empty() {
            return Err(ConfigError::Invalid("runner.apps_env is empty".into()));
        }
        Ok(())
    }

    /// Effective pool capacity
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }
}

/// Batch sizing and dispatch pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Target number of batches each worker handles when apps are plentiful
    pub apps_per_worker_factor: usize,

    /// Batch size used when the computed size rounds down to zero
    pub fallback_batch_size: usize,

    /// Pause between successive dispatches, in milliseconds
    pub dispatch_pause_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            apps_per_worker_factor: 3,
            fallback_batch_size: 2,
            dispatch_pause_ms: 871,
        }
    }
}

/// Request-rate shaping against the backend quota
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Upper bound (exclusive) of the millisecond jitter component
    pub jitter_max_ms: u64,

    /// Lower bound of the whole-second base component
    pub base_min_secs: u64,

    /// Quota averaging window, in seconds
    pub window_secs: u64,

    /// Requests allowed per window
    pub max_requests_per_window: u64,

    /// Multiplier applied to `window / max_requests` to size the base range
    pub spread_factor: u64,

    /// Fixed part of the delay before provisioning an instance
    pub provision_min_ms: u64,

    /// Upper bound (exclusive) of the random part of the provisioning delay
    pub provision_jitter_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            jitter_max_ms: 937,
            base_min_secs: 1,
            window_secs: 100,
            max_requests_per_window: 5,
            spread_factor: 6,
            provision_min_ms: 417,
            provision_jitter_ms: 54_937,
        }
    }
}

impl ThrottleConfig {
    /// Width of the base range in seconds
    pub fn base_span_secs(&self) -> u64 {
        self.spread_factor * self.window_secs / self.max_requests_per_window.max(1)
    }
}

/// External test-runner process
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program and arguments
    pub command: Vec<String>,

    /// Variable receiving the space-joined batch membership
    pub apps_env: String,

    /// Variable receiving the provisioned instance name
    pub instance_env: String,

    /// Variable receiving the emulator address
    pub emulator_env: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: vec!["bash".to_string(), "django_test_suite.sh".to_string()],
            apps_env: "DJANGO_TEST_APPS".to_string(),
            instance_env: "SPANNER_TEST_INSTANCE".to_string(),
            emulator_env: "SPANNER_EMULATOR_HOST".to_string(),
        }
    }
}

/// Local emulator endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub host: String,
    pub base_port: u16,

    /// Give each batch its own port above `base_port`
    pub per_batch_ports: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            base_port: 9010,
            per_batch_ports: true,
        }
    }
}

/// Cloud Spanner instance provisioning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpannerConfig {
    pub project_id: Option<String>,

    /// Use this existing instance instead of provisioning one
    pub instance: Option<String>,

    /// Display-name prefix of provisioned instances
    pub instance_prefix: String,

    pub node_count: u32,

    /// Zone used when the metadata server is unreachable
    pub default_zone: String,

    pub api_endpoint: String,
    pub metadata_endpoint: String,

    /// Static bearer token; when unset `token_command` is run instead
    #[serde(skip_serializing)]
    pub access_token: Option<String>,

    /// Command printing a fresh access token on stdout
    pub token_command: Vec<String>,

    /// Seconds a token from `token_command` is reused before running it again
    pub token_max_age_secs: u64,

    pub operation_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for SpannerConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            instance: None,
            instance_prefix: "django".to_string(),
            node_count: 1,
            default_zone: "us-central1-b".to_string(),
            api_endpoint: "https://spanner.googleapis.com".to_string(),
            metadata_endpoint: "http://metadata.google.internal".to_string(),
            access_token: None,
            token_command: vec![
                "gcloud".to_string(),
                "auth".to_string(),
                "print-access-token".to_string(),
            ],
            token_max_age_secs: 1800,
            operation_timeout_secs: 600,
            poll_interval_secs: 5,
        }
    }
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
