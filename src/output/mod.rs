//! Output formatting module
//!
//! Renders run summaries and batch plans.

mod formatter;

pub use formatter::{write_summary_to_file, OutputFormat, ResultFormatter};
