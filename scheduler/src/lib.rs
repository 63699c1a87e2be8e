//! Host scheduler
//!
//! One [`HostWorker`] per host, each ticking on its own. Workers start
//! staggered over `start_time_spread` so hosts are not all dialed at once.

use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info};

use hostwatch_core::{Error, Result};

pub mod messages;
pub mod outcome;
pub mod worker;

pub use outcome::{process, Outcome};
pub use worker::{HostWorker, TICK};

/// Initial delay of the worker at `index` out of `count`
pub fn stagger(index: usize, count: usize, spread: Duration) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = spread.as_nanos() * index as u128 / count as u128;
    Duration::from_nanos(nanos as u64)
}

/// Task scheduler
pub struct Scheduler {
    workers: Vec<HostWorker>,
    start_time_spread: Duration,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(start_time_spread: Duration) -> Self {
        Self {
            workers: Vec::new(),
            start_time_spread,
        }
    }

    /// Add a host worker
    pub fn add_worker(&mut self, worker: HostWorker) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start every worker and wait
    ///
    /// Workers never end on their own, so returning at all is an error.
    pub async fn run(self) -> Result<()> {
        let count = self.workers.len();
        info!(hosts = count, spread = ?self.start_time_spread, "Starting scheduler");

        let mut set = JoinSet::new();
        for (index, worker) in self.workers.into_iter().enumerate() {
            let delay = stagger(index, count, self.start_time_spread);
            set.spawn(worker.run_forever(delay));
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Host worker crashed");
            }
        }
        Err(Error::Scheduler("all host workers ended".to_string()))
    }
}
