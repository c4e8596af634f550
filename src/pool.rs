#![forbid(unsafe_code)]

//! Bounded pool for extraction work.
//!
//! `workers` is the hard upper bound on extractions running at the same
//! time. Callers beyond that wait for a permit instead of failing. Each job
//! also gets a deadline; once it passes the job future is dropped, which for
//! `yt-dlp` kills the child process, and the slot is handed to the next caller.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    time::{Instant, timeout_at},
};
use tracing::warn;

use crate::error::{FetchError, FetchResult};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(90);
/// Longer timeouts are clamped to this.
pub const MAX_EXTRACT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct ExtractionPool {
    permits: Arc<Semaphore>,
    workers: usize,
    timeout: Duration,
}

impl ExtractionPool {
    pub fn new(workers: usize, timeout: Duration) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            timeout: timeout.min(MAX_EXTRACT_TIMEOUT),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extractions currently holding a worker slot.
    pub fn busy(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    /// Runs `job` once a worker slot is free, handing it the deadline it is
    /// cut off at.
    pub async fn run<T, F, Fut>(&self, job: F) -> FetchResult<T>
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| FetchError::WorkerLost(err.to_string()))?;

        let now = Instant::now();
        let deadline = now
            .checked_add(self.timeout)
            .unwrap_or_else(|| now + DEFAULT_EXTRACT_TIMEOUT);

        match timeout_at(deadline, job(deadline)).await {
            Err(_) => {
                warn!(timeout = ?self.timeout, "extraction exceeded its deadline");
                Err(FetchError::ExtractionTimeout(self.timeout))
            }
            Ok(result) => result,
        }
    }
}

impl Default for ExtractionPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_EXTRACT_TIMEOUT)
    }
}
