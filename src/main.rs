//! test-fanout - parallel Django test runner for Cloud Spanner
//!
//! Splits a list of Django test apps into shuffled batches and runs them on a
//! bounded pool of test-suite processes, pacing batch starts so the shared
//! Spanner admin quota is not exhausted.
//!
//! ## Features
//!
//! - Outer sharding across CI workers (`DJANGO_WORKER_INDEX` / `DJANGO_WORKER_COUNT`)
//! - Randomized, cancellable rate shaping against the backend quota
//! - Fault isolation: a crashing batch never takes its siblings down
//! - Ctrl-C stops dispatch, lets running batches finish, then releases the instance
//! - Spanner instance provisioning, or the local emulator
//!
//! ## Usage
//!
//! ```bash
//! # Run every app in django_test_apps.txt against a fresh instance
//! PROJECT_ID=my-project test-fanout run
//!
//! # Use the emulator with four concurrent batches
//! test-fanout run --emulator -c 4
//!
//! # Preview the batches for worker 2 of 4
//! DJANGO_WORKER_INDEX=2 DJANGO_WORKER_COUNT=4 test-fanout plan --seed 1
//!
//! # Custom test command
//! test-fanout run --apps "admin_views auth_tests" -- ./run_suite.sh --parallel 1
//! ```

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

mod backend;
mod cli;
mod config;
mod executor;
mod models;
mod output;
mod shutdown;
mod utils;
mod workload;

use cli::{Args, Command, PlanArgs, RunArgs};
use config::{print_env_help, AppConfig, EnvConfig};
use executor::{CommandRunner, Partitioner, RateShaper, Scheduler};
use models::{AppName, EXIT_CONFIG_ERROR, EXIT_INTERRUPTED, EXIT_SUCCESS};
use output::{write_summary_to_file, OutputFormat, ResultFormatter};
use shutdown::ShutdownCoordinator;
use utils::logger::{init_logger, LogLevel};
use utils::rng::SharedRng;
use workload::WorkerShard;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let env = EnvConfig::load();

    init_logger(LogLevel::resolve(args.verbose, env.log_level.as_deref()));

    let result = match args.command {
        Command::Run(run_args) => run_tests(run_args, &env).await,
        Command::Plan(plan_args) => plan_batches(plan_args, &env).map(|()| EXIT_SUCCESS),
        Command::Env => {
            print_env_help();
            Ok(EXIT_SUCCESS)
        }
    };

    let code = result.unwrap_or_else(|e| {
        error!("{:#}", e);
        EXIT_CONFIG_ERROR
    });
    std::process::exit(code);
}

async fn run_tests(args: RunArgs, env: &EnvConfig) -> Result<i32> {
    let format = parse_format(&args.format)?;

    let mut config = load_config(args.source.config.as_deref(), env)?;
    args.apply_to(&mut config);
    config.validate()?;

    let Some(apps) = select_apps(&config, env.worker_shard()?)? else {
        return Ok(EXIT_SUCCESS);
    };

    let rng = SharedRng::new(config.seed);
    let concurrency = config.concurrency();
    let partitioner = Partitioner::from_config(&config.scheduler);
    let batches = partitioner.partition(apps, concurrency, &rng);

    info!(
        "Running {} batches with concurrency {}",
        batches.len(),
        concurrency
    );

    let coordinator = ShutdownCoordinator::new();
    let listener = coordinator.listen_for_ctrl_c();
    let shaper = RateShaper::new(config.throttle.clone(), config.use_emulator, rng.clone());

    let backend = match backend::provision(&config, &shaper, coordinator.token()).await {
        Ok(Some(backend)) => backend,
        Ok(None) => {
            warn!("Interrupted before the backend was ready");
            coordinator.finish().await;
            listener.abort();
            return Ok(EXIT_INTERRUPTED);
        }
        Err(e) => {
            listener.abort();
            return Err(e);
        }
    };
    let target = backend.target();
    coordinator.set_teardown(backend.release()).await;

    let runner = CommandRunner::new(config.runner.clone());
    let pause = Duration::from_millis(config.scheduler.dispatch_pause_ms);
    let scheduler = Scheduler::new(runner, shaper, concurrency)
        .with_dispatch_pause(pause);
    let summary = scheduler
        .run(batches, target, coordinator.token(), coordinator.tracker())
        .await;

    coordinator.finish().await;
    listener.abort();

    let formatter = ResultFormatter::new(format);
    println!("{}", formatter.format_summary(&summary));

    if let Some(path) = &args.output {
        match write_summary_to_file(path, &summary, format) {
            Ok(()) => info!("Summary saved to {}", path),
            Err(e) => warn!("Failed to save summary to {}: {:#}", path, e),
        }
    }

    Ok(summary.exit_code())
}

fn plan_batches(args: PlanArgs, env: &EnvConfig) -> Result<()> {
    let format = parse_format(&args.format)?;

    let mut config = load_config(args.source.config.as_deref(), env)?;
    args.source.apply_to(&mut config);
    config.validate()?;

    let Some(apps) = select_apps(&config, env.worker_shard()?)? else {
        return Ok(());
    };

    let rng = SharedRng::new(config.seed);
    let partitioner = Partitioner::from_config(&config.scheduler);
    let batches = partitioner.partition(apps, config.concurrency(), &rng);

    println!("{}", ResultFormatter::new(format).format_plan(&batches));
    Ok(())
}

fn parse_format(format: &str) -> Result<OutputFormat> {
    OutputFormat::from_str(format)
        .ok_or_else(|| anyhow!("Unknown output format: {format}"))
}

/// File configuration overlaid with environment variables
fn load_config(path: Option<&Path>, env: &EnvConfig) -> Result<AppConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| env.config_file.as_ref().map(Into::into));

    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            AppConfig::load(&path)?
        }
        None => AppConfig::default(),
    };
    env.apply_to(&mut config)?;
    Ok(config)
}

/// This worker's share of the app list, or `None` when there is nothing to do
fn select_apps(config: &AppConfig, shard: WorkerShard) -> Result<Option<Vec<AppName>>> {
    if !shard.is_active() {
        info!(
            "Worker index {} is not below worker count {}; nothing to do",
            shard.index, shard.count
        );
        return Ok(None);
    }

    let all = workload::load_apps(config)?;
    let apps = shard.select(&all);
    if apps.is_empty() {
        info!(
            "No apps assigned to worker {} of {}; nothing to do",
            shard.index, shard.count
        );
        return Ok(None);
    }

    Ok(Some(apps))
}
