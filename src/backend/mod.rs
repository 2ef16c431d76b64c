//! Backend endpoint management
//!
//! A run talks to one backend: the local emulator, an existing Spanner
//! instance, or an instance provisioned for this invocation and deleted
//! afterwards.

mod spanner;

pub use spanner::{SpannerAdmin, SpannerInstance};

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AppConfig, EmulatorConfig};
use crate::executor::{RateShaper, Wait};

/// Connection details handed to every batch
#[derive(Clone, Debug, Default)]
pub struct BackendTarget {
    instance: Option<String>,
    emulator: Option<Arc<EmulatorEndpoints>>,
}

impl BackendTarget {
    pub fn instance(name: impl Into<String>) -> Self {
        Self {
            instance: Some(name.into()),
            emulator: None,
        }
    }

    pub fn emulator(config: &EmulatorConfig) -> Self {
        Self {
            instance: None,
            emulator: Some(Arc::new(EmulatorEndpoints::new(config))),
        }
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Emulator address for the next batch, if running against the emulator
    pub fn next_emulator_host(&self) -> Option<String> {
        self.emulator.as_ref().map(|e| e.next_host())
    }
}

/// Emulator addresses, optionally one port per batch
#[derive(Debug)]
struct EmulatorEndpoints {
    host: String,
    base_port: u16,
    per_batch_ports: bool,
    allocated: AtomicU16,
}

impl EmulatorEndpoints {
    fn new(config: &EmulatorConfig) -> Self {
        Self {
            host: config.host.clone(),
            base_port: config.base_port,
            per_batch_ports: config.per_batch_ports,
            allocated: AtomicU16::new(0),
        }
    }

    fn next_host(&self) -> String {
        let port = if self.per_batch_ports {
            let n = self.allocated.fetch_add(1, Ordering::SeqCst) + 1;
            self.base_port.wrapping_add(n)
        } else {
            self.base_port
        };
        format!("{}:{}", self.host, port)
    }
}

/// The backend in use for this run
pub enum Backend {
    Emulator(EmulatorConfig),
    Existing(String),
    Provisioned(SpannerInstance),
}

impl Backend {
    pub fn target(&self) -> BackendTarget {
        match self {
            Backend::Emulator(config) => BackendTarget::emulator(config),
            Backend::Existing(name) => BackendTarget::instance(name.clone()),
            Backend::Provisioned(instance) => BackendTarget::instance(instance.id()),
        }
    }

    /// Release whatever this run acquired; failures are only logged
    pub async fn release(self) {
        match self {
            Backend::Emulator(_) | Backend::Existing(_) => {}
            Backend::Provisioned(instance) => {
                let id = instance.id().to_string();
                match instance.delete().await {
                    Ok(()) => info!("Deleted instance: {:?}", id),
                    Err(e) => warn!("Failed to delete instance {:?}: {:#}", id, e),
                }
            }
        }
    }
}

/// Obtain the backend for this run.
///
/// Returns `Ok(None)` when cancelled before an instance was requested. An
/// instance whose creation was interrupted is still returned so that it
/// gets released.
pub async fn provision(
    config: &AppConfig,
    shaper: &RateShaper,
    cancel: &CancellationToken,
) -> Result<Option<Backend>> {
    if config.use_emulator {
        info!("Using Spanner emulator at {}", config.emulator.host);
        return Ok(Some(Backend::Emulator(config.emulator.clone())));
    }

    if let Some(existing) = &config.spanner.instance {
        info!("Using existing Spanner instance: {:?}", existing);
        return Ok(Some(Backend::Existing(existing.clone())));
    }

    if shaper.wait_before_provision(cancel).await == Wait::Abandoned {
        return Ok(None);
    }

    let admin = SpannerAdmin::from_config(&config.spanner)
        .await
        .context("Failed to set up Spanner admin client")?;
    let created = admin
        .create_instance(cancel)
        .await
        .context("Failed to provision Spanner instance")?;

    Ok(created.map(|instance| {
        info!("Spanner instance: {:?}", instance.id());
        Backend::Provisioned(instance)
    }))
}
