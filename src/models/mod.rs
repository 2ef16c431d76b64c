//! Data models for test fan-out
//!
//! This module contains the work items, batches and outcomes shared by the
//! scheduler and the output formatters.

mod batch;
mod outcome;

pub use batch::{AppName, Batch};
pub use outcome::{
    BatchOutcome, BatchReport, RunSummary, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_INTERRUPTED,
    EXIT_SUCCESS,
};
