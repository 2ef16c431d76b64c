//! Test runner processes
//!
//! Runs one batch as an external process. The batch membership and backend
//! details travel through the child's environment; its output goes straight
//! to ours.

use std::future::Future;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendTarget;
use crate::config::RunnerConfig;
use crate::models::{Batch, BatchOutcome};

/// Runner errors; these are faults of the unit, not test failures
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Expected at least one app in batch {0}")]
    EmptyBatch(usize),

    #[error("No test runner command configured")]
    NoCommand,

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for test runner: {0}")]
    Wait(#[source] std::io::Error),
}

/// How the runner process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Exited { success: bool, code: Option<i32> },
    /// Terminated because of cancellation
    Killed,
}

impl RunStatus {
    pub fn into_outcome(self) -> BatchOutcome {
        match self {
            RunStatus::Exited { success: true, .. } => BatchOutcome::Passed,
            RunStatus::Exited { code, .. } => BatchOutcome::Failed { exit_code: code },
            RunStatus::Killed => BatchOutcome::Cancelled,
        }
    }
}

/// Executes a single batch
pub trait TaskRunner: Send + Sync + 'static {
    fn run(
        &self,
        batch: &Batch,
        target: &BackendTarget,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<RunStatus, RunnerError>> + Send;
}

/// Runs the configured command once per batch
#[derive(Clone, Debug)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Variables added to the inherited environment for one batch
    pub fn batch_env(&self, batch: &Batch, target: &BackendTarget) -> Vec<(String, String)> {
        let mut vars = vec![(self.config.apps_env.clone(), batch.joined())];
        if let Some(instance) = target.instance_name() {
            vars.push((self.config.instance_env.clone(), instance.to_string()));
        }
        if let Some(host) = target.next_emulator_host() {
            vars.push((self.config.emulator_env.clone(), host));
        }
        vars
    }
}

impl TaskRunner for CommandRunner {
    async fn run(
        &self,
        batch: &Batch,
        target: &BackendTarget,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, RunnerError> {
        if batch.is_empty() {
            return Err(RunnerError::EmptyBatch(batch.index()));
        }
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(RunnerError::NoCommand)?;

        let env = self.batch_env(batch, target);
        debug!("Batch {} environment: {:?}", batch.index(), env);

        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.clone(),
                source,
            })?;

        info!(
            "Batch {}: started {} for [{}]",
            batch.index(),
            program,
            batch.joined()
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(RunnerError::Wait)?;
                Ok(RunStatus::Exited {
                    success: status.success(),
                    code: status.code(),
                })
            }
            _ = cancel.cancelled() => {
                warn!("Batch {}: cancelled, stopping test runner", batch.index());
                if let Err(e) = child.kill().await {
                    warn!("Batch {}: failed to kill test runner: {}", batch.index(), e);
                }
                Ok(RunStatus::Killed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatorConfig;
    use std::time::{Duration, Instant};

    fn runner(command: &[&str]) -> CommandRunner {
        CommandRunner::new(RunnerConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    fn batch(apps: &[&str]) -> Batch {
        Batch::new(1, apps.iter().map(|a| (*a).into()).collect())
    }

    fn exited(success: bool, code: i32) -> RunStatus {
        RunStatus::Exited {
            success,
            code: Some(code),
        }
    }

    async fn run_once(r: &CommandRunner, batch: &Batch) -> Result<RunStatus, RunnerError> {
        let cancel = CancellationToken::new();
        r.run(batch, &BackendTarget::default(), &cancel).await
    }

    #[test]
    fn test_batch_env_with_instance() {
        let r = CommandRunner::new(RunnerConfig::default());
        let target = BackendTarget::instance("django-1");
        let env = r.batch_env(&batch(&["basic", "queries"]), &target);
        assert_eq!(
            env,
            vec![
                ("DJANGO_TEST_APPS".to_string(), "basic queries".to_string()),
                ("SPANNER_TEST_INSTANCE".to_string(), "django-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_batch_env_with_emulator() {
        let r = CommandRunner::new(RunnerConfig::default());
        let target = BackendTarget::emulator(&EmulatorConfig::default());
        let env = r.batch_env(&batch(&["basic"]), &target);
        assert_eq!(env.len(), 2);
        assert_eq!(env[1].0, "SPANNER_EMULATOR_HOST");
        assert_eq!(env[1].1, "localhost:9011");
    }

    #[test]
    fn test_status_to_outcome() {
        assert_eq!(exited(true, 0).into_outcome(), BatchOutcome::Passed);
        assert_eq!(
            exited(false, 4).into_outcome(),
            BatchOutcome::Failed { exit_code: Some(4) }
        );
        assert_eq!(RunStatus::Killed.into_outcome(), BatchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_batch_is_contract_violation() {
        let r = runner(&["true"]);
        let err = run_once(&r, &Batch::new(7, Vec::new())).await.unwrap_err();
        assert!(matches!(err, RunnerError::EmptyBatch(7)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let r = runner(&["/nonexistent/test-runner"]);
        let err = run_once(&r, &batch(&["basic"])).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command_is_an_error() {
        let r = runner(&[]);
        let err = run_once(&r, &batch(&["basic"])).await.unwrap_err();
        assert!(matches!(err, RunnerError::NoCommand));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_sees_batch_env() {
        let check = r#"test "$DJANGO_TEST_APPS" = "basic queries""#;
        let r = runner(&["sh", "-c", check]);
        let status = run_once(&r, &batch(&["basic", "queries"])).await.unwrap();
        assert_eq!(status, exited(true, 0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let r = runner(&["sh", "-c", "exit 3"]);
        let status = run_once(&r, &batch(&["basic"])).await.unwrap();
        assert_eq!(status, exited(false, 3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let r = runner(&["sleep", "30"]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let status = r
            .run(&batch(&["basic"]), &BackendTarget::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Killed);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
