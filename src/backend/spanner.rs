//! Cloud Spanner instance administration
//!
//! Talks to the Spanner Instance Admin REST API to create a throwaway
//! instance for a run and to delete it afterwards.

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SpannerConfig;
use crate::executor::Wait;

/// Long-running operation returned by instance creation
#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceResource {
    name: String,
    #[serde(default)]
    config: String,
    #[serde(default)]
    display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_count: Option<u32>,
    #[serde(default, skip_serializing)]
    state: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateInstanceRequest {
    instance_id: String,
    instance: InstanceResource,
}

enum TokenKind {
    Fixed(String),
    Command(Vec<String>),
}

struct TokenCache {
    kind: TokenKind,
    max_age: Duration,
    current: Mutex<Option<(String, Instant)>>,
}

/// Bearer tokens for the admin API.
///
/// Tokens printed by a command expire, and a run can outlive one, so the
/// command is run again once the cached token reaches `max_age`.
#[derive(Clone)]
struct TokenSource {
    inner: Arc<TokenCache>,
}

impl TokenSource {
    fn from_config(config: &SpannerConfig) -> Self {
        let kind = match &config.access_token {
            Some(token) => TokenKind::Fixed(token.clone()),
            None => TokenKind::Command(config.token_command.clone()),
        };
        Self {
            inner: Arc::new(TokenCache {
                kind,
                max_age: Duration::from_secs(config.token_max_age_secs),
                current: Mutex::new(None),
            }),
        }
    }

    async fn token(&self) -> Result<String> {
        let command = match &self.inner.kind {
            TokenKind::Fixed(token) => return Ok(token.clone()),
            TokenKind::Command(command) => command,
        };

        let mut current = self.inner.current.lock().await;
        if let Some((token, fetched_at)) = current.as_ref() {
            if fetched_at.elapsed() < self.inner.max_age {
                return Ok(token.clone());
            }
        }

        let token = run_token_command(command).await?;
        *current = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}

/// Client for the Spanner Instance Admin API
#[derive(Clone)]
pub struct SpannerAdmin {
    client: Client,
    config: SpannerConfig,
    project_id: String,
    tokens: TokenSource,
}

impl SpannerAdmin {
    /// Build a client; needs a project id and a working token source
    pub async fn from_config(config: &SpannerConfig) -> Result<Self> {
        let project_id = config
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .context("\"PROJECT_ID\" must be set in your environment")?
            .to_string();

        let tokens = TokenSource::from_config(config);
        // Fail before provisioning when no token can be had at all.
        tokens.token().await?;

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            config: config.clone(),
            project_id,
            tokens,
        })
    }

    fn project_prefix(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    fn url(&self, resource: &str) -> String {
        format!(
            "{}/v1/{}",
            self.config.api_endpoint.trim_end_matches('/'),
            resource
        )
    }

    /// Create a uniquely named instance and wait until it is READY.
    ///
    /// Returns `None` when cancelled before the create request is sent. Once
    /// the request is out, cancellation stops the polling and the instance
    /// is returned unverified so the caller still deletes it.
    pub async fn create_instance(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<SpannerInstance>> {
        let zone = find_zone(&self.client, &self.config).await;
        let region = region_from_zone(&zone);
        let instance_id = instance_id(&self.config.instance_prefix);
        let prefix = self.project_prefix();
        let name = format!("{prefix}/instances/{instance_id}");

        let request = CreateInstanceRequest {
            instance_id: instance_id.clone(),
            instance: InstanceResource {
                name: name.clone(),
                config: format!("{prefix}/instanceConfigs/regional-{region}"),
                display_name: instance_id.clone(),
                node_count: Some(self.config.node_count),
                state: None,
            },
        };

        if cancel.is_cancelled() {
            return Ok(None);
        }

        info!("Creating Spanner instance {} in {}", instance_id, region);
        let operation: Operation = self
            .client
            .post(self.url(&format!("{prefix}/instances")))
            .bearer_auth(self.tokens.token().await?)
            .json(&request)
            .send()
            .await
            .context("CreateInstance request failed")?
            .error_for_status()
            .context("CreateInstance rejected")?
            .json()
            .await
            .context("Failed to parse CreateInstance response")?;

        let instance = SpannerInstance {
            admin: self.clone(),
            id: instance_id,
            name,
        };

        if self.wait_operation(operation, cancel).await? == Wait::Abandoned {
            warn!(
                "Interrupted while creating instance {:?}; it will be deleted",
                instance.id
            );
            return Ok(Some(instance));
        }

        // Double check the instance really is READY before handing it out.
        let retrieved: InstanceResource = self
            .client
            .get(self.url(&instance.name))
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .context("GetInstance request failed")?
            .error_for_status()
            .context("GetInstance rejected")?
            .json()
            .await
            .context("Failed to parse GetInstance response")?;

        match retrieved.state.as_deref() {
            Some("READY") => Ok(Some(instance)),
            other => bail!("invalid state of instance: got {:?}, want READY", other),
        }
    }

    async fn wait_operation(
        &self,
        mut operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<Wait> {
        let deadline = Instant::now() + Duration::from_secs(self.config.operation_timeout_secs);
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));

        while !operation.done {
            if Instant::now() >= deadline {
                bail!("Timed out waiting for operation {}", operation.name);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Wait::Abandoned),
                _ = sleep(poll) => {}
            }
            debug!("Polling operation {}", operation.name);
            operation = self
                .client
                .get(self.url(&operation.name))
                .bearer_auth(self.tokens.token().await?)
                .send()
                .await
                .context("GetOperation request failed")?
                .error_for_status()
                .context("GetOperation rejected")?
                .json()
                .await
                .context("Failed to parse operation")?;
        }

        if let Some(error) = operation.error {
            bail!(
                "Operation {} failed ({}): {}",
                operation.name,
                error.code,
                error.message
            );
        }
        Ok(Wait::Elapsed)
    }

    async fn delete_instance(&self, name: &str) -> Result<()> {
        self.client
            .delete(self.url(name))
            .bearer_auth(self.tokens.token().await?)
            .send()
            .await
            .context("DeleteInstance request failed")?
            .error_for_status()
            .context("DeleteInstance rejected")?;
        Ok(())
    }
}

/// An instance created for this run
pub struct SpannerInstance {
    admin: SpannerAdmin,
    id: String,
    name: String,
}

impl SpannerInstance {
    /// Short id, as the test suite expects it
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn delete(self) -> Result<()> {
        self.admin.delete_instance(&self.name).await
    }
}

/// Region of a zone: everything before the last '-'
pub fn region_from_zone(zone: &str) -> &str {
    match zone.rfind('-') {
        Some(i) => &zone[..i],
        None => zone,
    }
}

fn instance_id(prefix: &str) -> String {
    let suffix = format!("{:016x}", rand::random::<u64>());
    format!("{}-{}", prefix, &suffix[..12])
}

/// Zone from the GCE metadata server, or the configured default
async fn find_zone(client: &Client, config: &SpannerConfig) -> String {
    let url = format!(
        "{}/computeMetadata/v1/instance/zone",
        config.metadata_endpoint.trim_end_matches('/')
    );
    let response = client
        .get(&url)
        .header("Metadata-Flavor", "Google")
        .timeout(Duration::from_secs(2))
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => match resp.text().await {
            // "projects/123456/zones/us-central1-b"
            Ok(body) => match body.trim().rsplit('/').next() {
                Some(zone) if !zone.is_empty() => return zone.to_string(),
                _ => {}
            },
            Err(e) => debug!("Unreadable metadata response: {}", e),
        },
        Ok(resp) => debug!("Metadata server returned {}", resp.status()),
        Err(e) => debug!("Not on GCE ({}), using default zone", e),
    }
    config.default_zone.clone()
}

async fn run_token_command(command: &[String]) -> Result<String> {
    let (program, args) = command
        .split_first()
        .context("No access token and no token command configured")?;

    debug!("Fetching access token with {}", program);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("No access token configured and failed to run {program}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("{} failed: {}", command.join(" "), stderr.trim());
        bail!("Failed to obtain an access token from {}", program);
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        bail!("{} returned an empty access token", program);
    }
    Ok(token)
}
