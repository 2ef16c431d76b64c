//! Logging setup
//!
//! Log lines go to stderr so the plan and report printed on stdout stay
//! parseable. Runner processes inherit stdio and are not routed through here.

use std::fmt;
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Verbosity of the fan-out's own log lines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevel(Level);

impl LogLevel {
    pub const DEBUG: LogLevel = LogLevel(Level::DEBUG);
    pub const INFO: LogLevel = LogLevel(Level::INFO);

    /// `--verbose` wins, then TEST_FANOUT_LOG, then info. An unknown name
    /// in the environment falls back to info rather than aborting the run.
    pub fn resolve(verbose: bool, from_env: Option<&str>) -> Self {
        if verbose {
            return LogLevel::DEBUG;
        }
        from_env
            .and_then(|name| name.parse().ok())
            .unwrap_or(LogLevel::INFO)
    }

    /// Filter directive limited to this crate, so dependency chatter from
    /// reqwest and hyper stays out of the CI log.
    fn directive(self) -> String {
        format!("{}={}", env!("CARGO_CRATE_NAME"), self.0)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warning" => Ok(LogLevel(Level::WARN)),
            other => other
                .parse::<Level>()
                .map(LogLevel)
                .map_err(|_| format!("unknown log level: {s}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn init_logger(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.directive()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
