//! Output formatters for run results
//!
//! Provides JSON, Table, and summary output formats.

use serde::Serialize;
use std::io::Write;

use crate::models::{
    AppName, Batch, BatchOutcome, BatchReport, RunSummary, EXIT_FAILURE, EXIT_SUCCESS,
};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "summary" | "brief" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn to_json<T: Serialize>(&self, value: &T) -> String {
        if self.format == OutputFormat::JsonPretty {
            serde_json::to_string_pretty(value).unwrap_or_default()
        } else {
            serde_json::to_string(value).unwrap_or_default()
        }
    }

    fn format_report_table(&self, report: &BatchReport) -> String {
        let status = format!("{} {}", report.outcome.symbol(), report.outcome);
        let status_str = if self.colorize {
            let color = match report.outcome {
                BatchOutcome::Passed => "32",
                BatchOutcome::Cancelled => "33",
                BatchOutcome::Failed { .. } | BatchOutcome::Fault { .. } => "31",
            };
            format!("\x1b[{color}m{status:<14}\x1b[0m")
        } else {
            format!("{status:<14}")
        };

        let mut line = format!(
            "{:3}. {} [{:>8}ms] {}",
            report.batch,
            status_str,
            report.duration_ms,
            join_apps(&report.apps)
        );
        if let BatchOutcome::Fault { message } = &report.outcome {
            line.push_str(&format!("\n       {message}"));
        }
        line
    }

    /// Format the run summary
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(summary),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        // Header
        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        let started = summary.started_at.format("%Y-%m-%d %H:%M:%S UTC");
        output.push_str(&format!("║  Test fan-out - {:44} ║\n", started.to_string()));
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        // Results
        for report in &summary.reports {
            output.push_str(&format!("  {}\n", self.format_report_table(report)));
        }

        // Footer
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        let pass_str = if self.colorize {
            format!("\x1b[32m{}\x1b[0m", summary.passed)
        } else {
            summary.passed.to_string()
        };
        let fail_str = if self.colorize && summary.any_failure {
            format!("\x1b[31m{}\x1b[0m", summary.failed)
        } else {
            summary.failed.to_string()
        };

        output.push_str(&format!(
            "║  Batches: {}/{} | Pass: {} | Fail: {} | Fault: {} | Cancelled: {}\n",
            summary.dispatched,
            summary.planned,
            pass_str,
            fail_str,
            summary.faulted,
            summary.cancelled
        ));
        output.push_str(&format!(
            "║  Pass Rate: {:5.1}% | Duration: {}ms{}\n",
            summary.pass_rate(),
            summary.duration_ms,
            summary
                .interrupted
                .then_some(" | INTERRUPTED")
                .unwrap_or_default()
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        let verdict = match summary.exit_code() {
            EXIT_SUCCESS => "OK",
            EXIT_FAILURE => "FAILED",
            _ => "INTERRUPTED",
        };
        format!(
            "{}: {}/{} batches passed ({:.1}%), {} failed, {} faulted, {} cancelled in {}ms",
            verdict,
            summary.passed,
            summary.planned,
            summary.pass_rate(),
            summary.failed,
            summary.faulted,
            summary.cancelled,
            summary.duration_ms
        )
    }

    /// Format a batch plan without running it
    pub fn format_plan(&self, batches: &[Batch]) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.to_json(&batches),
            OutputFormat::Summary => {
                let apps: usize = batches.iter().map(Batch::len).sum();
                format!("{} apps in {} batches", apps, batches.len())
            }
            OutputFormat::Table => {
                let mut output = String::new();
                for batch in batches {
                    output.push_str(&format!(
                        "{:3}. ({:2}) {}\n",
                        batch.index(),
                        batch.len(),
                        batch.joined()
                    ));
                }
                let apps: usize = batches.iter().map(Batch::len).sum();
                output.push_str(&format!("{} apps in {} batches\n", apps, batches.len()));
                output
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn join_apps(apps: &[AppName]) -> String {
    apps.iter().map(AppName::as_str).collect::<Vec<_>>().join(" ")
}

/// Write a run summary to a file
pub fn write_summary_to_file(
    path: &str,
    summary: &RunSummary,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_summary(summary);

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}
