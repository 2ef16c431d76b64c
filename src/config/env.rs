//! Environment variable configuration
//!
//! Reads the variables set by CI for each worker and overlays them on the
//! file configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{AppConfig, ConfigError};
use crate::workload::WorkerShard;

const WORKER_INDEX: &str = "DJANGO_WORKER_INDEX";
const WORKER_COUNT: &str = "DJANGO_WORKER_COUNT";
const APPS_FILE: &str = "DJANGO_TEST_APPS_FILE";
const APPS_LIST: &str = "DJANGO_TEST_APPS_LIST";
const USE_EMULATOR: &str = "USE_SPANNER_EMULATOR";
const CONCURRENCY: &str = "TEST_FANOUT_CONCURRENCY";
const CONFIG: &str = "TEST_FANOUT_CONFIG";
const LOG: &str = "TEST_FANOUT_LOG";
const SEED: &str = "TEST_FANOUT_SEED";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Raw DJANGO_WORKER_INDEX
    pub worker_index: Option<String>,
    /// Raw DJANGO_WORKER_COUNT
    pub worker_count: Option<String>,
    /// App list file from DJANGO_TEST_APPS_FILE
    pub apps_file: Option<String>,
    /// Inline app list from DJANGO_TEST_APPS_LIST
    pub apps: Option<String>,
    /// USE_SPANNER_EMULATOR: set and not "0"
    pub use_emulator: Option<bool>,
    /// Raw TEST_FANOUT_CONCURRENCY
    pub concurrency: Option<String>,
    /// Config file from TEST_FANOUT_CONFIG
    pub config_file: Option<String>,
    /// Log level from TEST_FANOUT_LOG
    pub log_level: Option<String>,
    /// Raw TEST_FANOUT_SEED
    pub seed: Option<String>,
    /// PROJECT_ID, falling back to GOOGLE_CLOUD_PROJECT
    pub project_id: Option<String>,
    /// SPANNER_ACCESS_TOKEN, falling back to GOOGLE_OAUTH_ACCESS_TOKEN
    pub access_token: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            worker_index: get_env(WORKER_INDEX),
            worker_count: get_env(WORKER_COUNT),
            apps_file: get_env(APPS_FILE),
            apps: get_env(APPS_LIST),
            use_emulator: env::var(USE_EMULATOR).ok().map(|v| !v.is_empty() && v != "0"),
            concurrency: get_env(CONCURRENCY),
            config_file: get_env(CONFIG),
            log_level: get_env(LOG),
            seed: get_env(SEED),
            project_id: get_env("PROJECT_ID").or_else(|| get_env("GOOGLE_CLOUD_PROJECT")),
            access_token: get_env("SPANNER_ACCESS_TOKEN")
                .or_else(|| get_env("GOOGLE_OAUTH_ACCESS_TOKEN")),
        }
    }

    /// Overlay the variables that are set onto a file configuration.
    ///
    /// A numeric variable that does not parse is an error, not a silent
    /// fallback to the default.
    pub fn apply_to(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        if let Some(file) = &self.apps_file {
            config.apps_file = PathBuf::from(file);
        }
        if let Some(apps) = &self.apps {
            config.apps = Some(apps.clone());
        }
        if let Some(use_emulator) = self.use_emulator {
            config.use_emulator = use_emulator;
        }
        if let Some(concurrency) = parse_number(CONCURRENCY, self.concurrency.as_deref())? {
            config.concurrency = Some(concurrency);
        }
        if let Some(seed) = parse_number(SEED, self.seed.as_deref())? {
            config.seed = Some(seed);
        }
        if let Some(project) = &self.project_id {
            config.spanner.project_id = Some(project.clone());
        }
        if let Some(token) = &self.access_token {
            config.spanner.access_token = Some(token.clone());
        }
        Ok(())
    }

    /// Outer shard for this invocation; unset variables mean "the whole list"
    pub fn worker_shard(&self) -> Result<WorkerShard, ConfigError> {
        let index = parse_number(WORKER_INDEX, self.worker_index.as_deref())?;
        let count = parse_number(WORKER_COUNT, self.worker_count.as_deref())?;
        let shard = WorkerShard::new(index.unwrap_or(0), count.unwrap_or(1));
        if shard.count == 0 {
            return Err(ConfigError::ZeroWorkerCount);
        }
        Ok(shard)
    }
}

/// Parse a variable that was set; unset stays `None`
fn parse_number<T: FromStr>(
    name: &'static str,
    raw: Option<&str>,
) -> Result<Option<T>, ConfigError> {
    match raw {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::InvalidInteger {
                name,
                value: value.to_string(),
            }),
        },
    }
}

/// Get a non-empty environment variable
fn get_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Print the environment variables the tool reads
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {WORKER_INDEX}      Index of this invocation among the CI workers");
    println!("  {WORKER_COUNT}      Number of CI workers sharing the app list");
    println!("  {APPS_FILE}    File with one app name per line");
    println!("  {APPS_LIST}    Inline app list (whitespace or comma separated)");
    println!("  {USE_EMULATOR}     Use the local emulator (any value except 0)");
    println!("  {CONCURRENCY}  Maximum concurrent batches");
    println!("  {CONFIG}       Path to a YAML or JSON configuration file");
    println!("  {LOG}          Log level (trace, debug, info, warn, error)");
    println!("  {SEED}         Fixed RNG seed");
    println!("  PROJECT_ID                Google Cloud project for instance provisioning");
    println!("  SPANNER_ACCESS_TOKEN      Bearer token for the Spanner admin API");
    println!();
    println!("Example:");
    println!("  export {WORKER_INDEX}=0 {WORKER_COUNT}=4");
    println!("  export PROJECT_ID=my-project");
    println!("  test-fanout run");
}

/// Builder for setting environment variables in tests
#[cfg(test)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

#[cfg(test)]
impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    pub fn var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.push((key.to_string(), value.into()));
        self
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
#[cfg(test)]
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

#[cfg(test)]
impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests in this module mutate process-wide variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.worker_index.is_none());
        assert!(config.use_emulator.is_none());
    }

    #[test]
    fn test_worker_shard_defaults_to_whole_list() {
        let shard = EnvConfig::default().worker_shard().unwrap();
        assert_eq!(shard, WorkerShard::new(0, 1));
    }

    #[test]
    fn test_worker_shard_rejects_garbage() {
        let config = EnvConfig {
            worker_index: Some("two".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.worker_shard(),
            Err(ConfigError::InvalidInteger { name: WORKER_INDEX, .. })
        ));

        let config = EnvConfig {
            worker_count: Some("0".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.worker_shard(),
            Err(ConfigError::ZeroWorkerCount)
        ));
    }

    #[test]
    fn test_env_builder_round_trip() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvBuilder::new()
            .var(WORKER_INDEX, "2")
            .var(WORKER_COUNT, "5")
            .var(CONCURRENCY, "7")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.worker_index.as_deref(), Some("2"));
        assert_eq!(config.concurrency.as_deref(), Some("7"));
        assert_eq!(config.worker_shard().unwrap(), WorkerShard::new(2, 5));
    }

    #[test]
    fn test_emulator_flag_parsing() {
        let _lock = ENV_LOCK.lock().unwrap();
        {
            let _guard = EnvBuilder::new().var(USE_EMULATOR, "0").apply_scoped();
            assert_eq!(EnvConfig::load().use_emulator, Some(false));
        }
        {
            let _guard = EnvBuilder::new().var(USE_EMULATOR, "true").apply_scoped();
            assert_eq!(EnvConfig::load().use_emulator, Some(true));
        }
    }

    #[test]
    fn test_apply_to_overrides_file_values() {
        let env = EnvConfig {
            apps_file: Some("other.txt".into()),
            use_emulator: Some(true),
            concurrency: Some("2".into()),
            seed: Some(" 42 ".into()),
            project_id: Some("proj".into()),
            ..Default::default()
        };
        let mut config = AppConfig::default();
        env.apply_to(&mut config).unwrap();

        assert_eq!(config.apps_file, PathBuf::from("other.txt"));
        assert!(config.use_emulator);
        assert_eq!(config.concurrency, Some(2));
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.spanner.project_id.as_deref(), Some("proj"));
    }

    #[test]
    fn test_apply_to_rejects_bad_numbers() {
        let env = EnvConfig {
            concurrency: Some("abc".into()),
            ..Default::default()
        };
        let mut config = AppConfig::default();
        assert!(matches!(
            env.apply_to(&mut config),
            Err(ConfigError::InvalidInteger { name: CONCURRENCY, .. })
        ));
        assert!(config.concurrency.is_none());

        let env = EnvConfig {
            seed: Some("-1".into()),
            ..Default::default()
        };
        assert!(matches!(
            env.apply_to(&mut config),
            Err(ConfigError::InvalidInteger { name: SEED, .. })
        ));
    }
}
