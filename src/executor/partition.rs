//! Batch partitioning
//!
//! Shuffles the app list and cuts it into worker-sized batches.

use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::models::{AppName, Batch};
use crate::utils::rng::SharedRng;

/// Splits apps into batches sized for a pool of `concurrency` slots
#[derive(Clone, Debug)]
pub struct Partitioner {
    apps_per_worker_factor: usize,
    fallback_batch_size: usize,
}

impl Partitioner {
    pub fn new(apps_per_worker_factor: usize, fallback_batch_size: usize) -> Self {
        Self {
            apps_per_worker_factor: apps_per_worker_factor.max(1),
            fallback_batch_size: fallback_batch_size.max(1),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.apps_per_worker_factor, config.fallback_batch_size)
    }

    /// Number of apps per batch for `total` apps over `concurrency` slots.
    ///
    /// Small lists get one app per batch. Otherwise each slot should see
    /// about `apps_per_worker_factor` batches; a size that rounds down to
    /// zero falls back to `fallback_batch_size`.
    pub fn batch_size(&self, total: usize, concurrency: usize) -> usize {
        let concurrency = concurrency.max(1);
        let k = self.apps_per_worker_factor;

        let size = if total <= concurrency || total <= k {
            1
        } else {
            total / (k * concurrency)
        };

        if size == 0 {
            self.fallback_batch_size
        } else {
            size
        }
    }

    /// Shuffle `apps` and split them into batches numbered from 1
    pub fn partition(
        &self,
        mut apps: Vec<AppName>,
        concurrency: usize,
        rng: &SharedRng,
    ) -> Vec<Batch> {
        rng.with(|rng| apps.shuffle(rng));

        let size = self.batch_size(apps.len(), concurrency);
        info!(
            "Partitioning {} apps into batches of {} ({} slots)",
            apps.len(),
            size,
            concurrency
        );

        let batches: Vec<Batch> = apps
            .chunks(size)
            .filter(|chunk| !chunk.is_empty())
            .enumerate()
            .map(|(i, chunk)| Batch::new(i + 1, chunk.to_vec()))
            .collect();

        debug!("Formed {} batches", batches.len());
        batches
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}
