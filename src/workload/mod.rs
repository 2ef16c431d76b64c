//! Workload loading
//!
//! Reads app names from the configured source and applies the outer
//! worker-index/worker-count shard before any partitioning happens.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::config::{AppConfig, ConfigError};
use crate::models::AppName;

/// Split an app list on newlines, whitespace and commas.
///
/// Blank entries and `#` comment lines are dropped; order is preserved.
pub fn parse_apps(text: &str) -> Vec<AppName> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .flat_map(|line| line.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|entry| !entry.is_empty())
        .map(AppName::new)
        .collect()
}

/// Read an app list file
pub fn read_apps_file(path: impl AsRef<Path>) -> Result<Vec<AppName>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::MissingApps(path.display().to_string()).into());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read app list: {}", path.display()))?;
    Ok(parse_apps(&content))
}

/// Load the full app list, preferring an inline list over the file
pub fn load_apps(config: &AppConfig) -> Result<Vec<AppName>> {
    let apps = match &config.apps {
        Some(inline) => {
            debug!("Using inline app list");
            parse_apps(inline)
        }
        None => {
            debug!("Reading app list from {}", config.apps_file.display());
            read_apps_file(&config.apps_file)?
        }
    };

    if apps.is_empty() {
        return Err(ConfigError::EmptyApps.into());
    }

    info!("Loaded {} apps", apps.len());
    Ok(apps)
}

/// Position of this invocation among independent CI workers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerShard {
    pub index: usize,
    pub count: usize,
}

impl WorkerShard {
    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// Whether this worker has a slot at all
    pub fn is_active(&self) -> bool {
        self.index < self.count
    }

    /// Contiguous slice of `apps` owned by this worker.
    ///
    /// Each worker takes `ceil(len / count)` apps; trailing workers may get
    /// fewer or none.
    pub fn select(&self, apps: &[AppName]) -> Vec<AppName> {
        if !self.is_active() {
            return Vec::new();
        }
        let per_worker = apps.len().div_ceil(self.count);
        let start = (self.index * per_worker).min(apps.len());
        let end = (start + per_worker).min(apps.len());

        info!(
            "Worker {}/{}: apps [{}, {}) of {}",
            self.index,
            self.count,
            start,
            end,
            apps.len()
        );
        apps[start..end].to_vec()
    }
}

impl Default for WorkerShard {
    fn default() -> Self {
        Self::new(0, 1)
    }
}
