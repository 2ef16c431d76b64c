//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;

/// Fan integration test apps out over a bounded pool of runners
#[derive(Parser, Debug)]
#[command(name = "test-fanout")]
#[command(author = "hephaex@gmail.com")]
#[command(version)]
#[command(about = "Run Django test apps in parallel batches against Cloud Spanner")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision the backend and run every batch
    Run(RunArgs),

    /// Show how the apps would be batched without running anything
    Plan(PlanArgs),

    /// List the environment variables that are read
    Env,
}

/// Where the apps come from and how they are split
#[derive(ClapArgs, Debug, Default)]
pub struct SourceArgs {
    /// Configuration file (YAML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// File with one app name per line
    #[arg(long)]
    pub apps_file: Option<PathBuf>,

    /// Inline app list (whitespace or comma separated)
    #[arg(long)]
    pub apps: Option<String>,

    /// Maximum number of batches running at once
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Seed for the shuffle and the rate shaper
    #[arg(long)]
    pub seed: Option<u64>,
}

impl SourceArgs {
    /// Overlay the flags that were given
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(path) = &self.apps_file {
            config.apps_file = path.clone();
        }
        if let Some(apps) = &self.apps {
            config.apps = Some(apps.clone());
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = Some(concurrency);
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
    }
}

/// Arguments for run command
#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Use the local Spanner emulator (disables throttling)
    #[arg(long)]
    pub emulator: bool,

    /// Use an existing instance instead of creating one
    #[arg(long)]
    pub instance: Option<String>,

    /// Pause between dispatches in milliseconds (0 disables)
    #[arg(long)]
    pub dispatch_pause_ms: Option<u64>,

    /// Output format (table, json, json-pretty, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Save the summary to a file
    #[arg(short, long)]
    pub output: Option<String>,

    /// Test command to run per batch, overriding the configured one
    #[arg(last = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn apply_to(&self, config: &mut AppConfig) {
        self.source.apply_to(config);
        if self.emulator {
            config.use_emulator = true;
        }
        if let Some(instance) = &self.instance {
            config.spanner.instance = Some(instance.clone());
        }
        if let Some(pause) = self.dispatch_pause_ms {
            config.scheduler.dispatch_pause_ms = pause;
        }
        if !self.command.is_empty() {
            config.runner.command = self.command.clone();
        }
    }
}

/// Arguments for plan command
#[derive(ClapArgs, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Output format (table, json, json-pretty)
    #[arg(short, long, default_value = "table")]
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_command() {
        let args = Args::parse_from(["test-fanout", "env"]);
        assert!(matches!(args.command, Command::Env));
        assert!(!args.verbose);
    }

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "test-fanout",
            "run",
            "--apps",
            "admin,auth",
            "-c",
            "4",
            "--emulator",
            "--seed",
            "7",
            "-v",
            "--",
            "pytest",
            "-x",
        ]);
        assert!(args.verbose);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.source.apps.as_deref(), Some("admin,auth"));
                assert_eq!(run.source.concurrency, Some(4));
                assert_eq!(run.source.seed, Some(7));
                assert!(run.emulator);
                assert_eq!(run.format, "table");
                assert_eq!(run.command, vec!["pytest", "-x"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_args_overlay() {
        let args = Args::parse_from([
            "test-fanout",
            "run",
            "--apps-file",
            "apps.txt",
            "--instance",
            "shared",
            "--dispatch-pause-ms",
            "0",
            "--",
            "./suite.sh",
        ]);
        let Command::Run(run) = args.command else {
            panic!("Expected Run command");
        };

        let mut config = AppConfig::default();
        run.apply_to(&mut config);

        assert_eq!(config.apps_file, PathBuf::from("apps.txt"));
        assert_eq!(config.spanner.instance.as_deref(), Some("shared"));
        assert_eq!(config.scheduler.dispatch_pause_ms, 0);
        assert_eq!(config.runner.command, vec!["./suite.sh"]);
        assert!(!config.use_emulator);
        assert!(config.concurrency.is_none());
    }

    #[test]
    fn test_plan_args() {
        let args = Args::parse_from(["test-fanout", "plan", "--apps", "a b c", "--format", "json"]);
        match args.command {
            Command::Plan(plan) => {
                assert_eq!(plan.source.apps.as_deref(), Some("a b c"));
                assert_eq!(plan.format, "json");
            }
            _ => panic!("Expected Plan command"),
        }
    }
}
