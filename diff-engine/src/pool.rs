//! Off-thread inline matching.
//!
//! The pool owns a small tokio runtime. Jobs carry their two texts by value
//! through an unbounded channel shared by the workers; each worker runs the
//! character matcher on the blocking thread pool and sends `(id, opcodes)`
//! back over a bounded result channel. The owner drains results from its
//! own thread with [`MatcherPool::try_recv`] / [`MatcherPool::recv_timeout`].

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex};

use crate::error::{EngineError, Result};
use crate::matcher::inline_opcodes;
use crate::types::DiffChunk;

pub type JobId = u64;

/// Capacity of the result channel; workers wait while it is full.
const RESULT_QUEUE_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    /// How long [`MatcherPool::recv_timeout`] waits for a result.
    pub poll_interval: Duration,
    /// How long shutdown waits for running jobs before abandoning them.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_millis(1000),
        }
    }
}

enum Job {
    Match { id: JobId, text1: String, textn: String },
    Stop,
}

/// Completed job. `opcodes` is `None` when the matcher failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub id: JobId,
    pub opcodes: Option<Vec<DiffChunk>>,
}

pub struct MatcherPool {
    runtime: Option<Runtime>,
    jobs: mpsc::UnboundedSender<Job>,
    results: mpsc::Receiver<MatchResult>,
    next_id: JobId,
    config: PoolConfig,
}

impl std::fmt::Debug for MatcherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatcherPool")
            .field("running", &self.runtime.is_some())
            .field("next_id", &self.next_id)
            .field("config", &self.config)
            .finish()
    }
}

impl MatcherPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let workers = config.workers.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers)
            .thread_name("inline-matcher")
            .enable_time()
            .build()
            .map_err(EngineError::Runtime)?;

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE_DEPTH);
        let job_rx = Arc::new(Mutex::new(job_rx));
        for index in 0..workers {
            runtime.spawn(worker(index, Arc::clone(&job_rx), result_tx.clone()));
        }
        tracing::debug!(workers, "matcher pool started");

        Ok(Self {
            runtime: Some(runtime),
            jobs: job_tx,
            results: result_rx,
            next_id: 0,
            config: PoolConfig { workers, ..config },
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Queue a comparison, returning its id.
    pub fn submit(&mut self, text1: String, textn: String) -> Result<JobId> {
        if self.runtime.is_none() {
            return Err(EngineError::PoolShutDown);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.jobs
            .send(Job::Match { id, text1, textn })
            .map_err(|_| EngineError::PoolShutDown)?;
        Ok(id)
    }

    /// A finished result, if one is ready now.
    pub fn try_recv(&mut self) -> Option<MatchResult> {
        self.results.try_recv().ok()
    }

    /// Wait up to the poll interval for a result.
    pub fn recv_timeout(&mut self) -> Option<MatchResult> {
        let runtime = self.runtime.as_ref()?;
        let wait = self.config.poll_interval;
        let results = &mut self.results;
        runtime
            .block_on(async { tokio::time::timeout(wait, results.recv()).await })
            .ok()
            .flatten()
    }

    /// Stop the workers, waiting at most the grace period for running
    /// jobs. Queued jobs and undelivered results are discarded.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        for _ in 0..self.config.workers {
            // A send only fails once every worker has already exited.
            let _ = self.jobs.send(Job::Stop);
        }
        runtime.shutdown_timeout(self.config.shutdown_grace);
        self.results.close();
        while self.results.try_recv().is_ok() {}
        tracing::debug!("matcher pool stopped");
    }
}

impl Drop for MatcherPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker(
    index: usize,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    results: mpsc::Sender<MatchResult>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let (id, text1, textn) = match job {
            Some(Job::Match { id, text1, textn }) => (id, text1, textn),
            Some(Job::Stop) | None => break,
        };

        let opcodes = match tokio::task::spawn_blocking(move || inline_opcodes(&text1, &textn)).await {
            Ok(opcodes) => Some(opcodes),
            Err(e) => {
                tracing::error!(worker = index, job = id, error = %e, "inline matcher failed, dropping job");
                None
            }
        };
        if results.send(MatchResult { id, opcodes }).await.is_err() {
            break;
        }
    }
    tracing::trace!(worker = index, "matcher worker exiting");
}
