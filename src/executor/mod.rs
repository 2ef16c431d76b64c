//! Batch execution engine
//!
//! Partitions the workload, shapes request rate, and runs batches on a
//! bounded pool.

mod parallel;
mod partition;
mod runner;
mod state;
mod throttle;

pub use parallel::Scheduler;
pub use partition::Partitioner;
pub use runner::CommandRunner;
pub use state::WorkTracker;
pub use throttle::{RateShaper, Wait};
