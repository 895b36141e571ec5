//! Bounded pool of background workers running memory extraction jobs.
//!
//! Jobs are independent of the request that scheduled them: a client
//! disconnect never cancels one. Each job runs in its own task with a
//! timeout, so a panic or hang only loses that job.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::extractor::{ExtractionError, ExtractionReport, MemoryExtractor};

pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionJob {
    pub user_id: i64,
    pub conversation_id: i64,
}

#[async_trait]
pub trait ExtractionHandler: Send + Sync {
    async fn handle(&self, job: ExtractionJob) -> Result<ExtractionReport, ExtractionError>;
}

#[async_trait]
impl ExtractionHandler for MemoryExtractor {
    async fn handle(&self, job: ExtractionJob) -> Result<ExtractionReport, ExtractionError> {
        self.extract(job.user_id, job.conversation_id).await
    }
}

pub struct MemoryWorkerPool {
    sender: Mutex<Option<mpsc::Sender<ExtractionJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryWorkerPool {
    /// Spawn `workers` tasks on the current runtime
    pub fn start(
        handler: Arc<dyn ExtractionHandler>,
        workers: usize,
        capacity: usize,
        job_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    log::debug!("[MEMORY] Worker {} started", worker_id);
                    loop {
                        // Hold the receiver lock only while waiting for the next job
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        run_job(handler.clone(), job, job_timeout).await;
                    }
                    log::debug!("[MEMORY] Worker {} stopped", worker_id);
                })
            })
            .collect();

        log::info!(
            "[MEMORY] Worker pool started: {} workers, queue capacity {}",
            workers.max(1),
            capacity.max(1)
        );

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Queue a job without waiting. Returns false if it was dropped.
    pub fn schedule(&self, job: ExtractionJob) -> bool {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            log::warn!("[MEMORY] Pool shut down, dropping job for conversation {}", job.conversation_id);
            return false;
        };

        match sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                log::warn!(
                    "[MEMORY] Queue full, dropping extraction for conversation {}",
                    job.conversation_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                log::warn!(
                    "[MEMORY] Queue closed, dropping extraction for conversation {}",
                    job.conversation_id
                );
                false
            }
        }
    }

    /// False once shutdown has begun
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting jobs and wait up to `grace` for queued and in-flight
    /// jobs to finish. Workers still busy after that are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.sender.lock().take();
        let handles = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(grace, futures_util::future::join_all(handles)).await {
            Ok(_) => log::info!("[MEMORY] Worker pool drained"),
            Err(_) => {
                log::warn!("[MEMORY] Worker pool did not drain within {:?}, aborting", grace);
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

async fn run_job(handler: Arc<dyn ExtractionHandler>, job: ExtractionJob, timeout: Duration) {
    let task = tokio::spawn(async move { handler.handle(job).await });
    let abort = task.abort_handle();

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(report))) => log::debug!(
            "[MEMORY] Job for conversation {} done: {:?}",
            job.conversation_id,
            report
        ),
        Ok(Ok(Err(e))) => log::warn!(
            "[MEMORY] Extraction for conversation {} failed: {}",
            job.conversation_id,
            e
        ),
        Ok(Err(e)) if e.is_panic() => log::error!(
            "[MEMORY] Extraction for conversation {} panicked",
            job.conversation_id
        ),
        Ok(Err(e)) => log::warn!("[MEMORY] Extraction task ended: {}", e),
        Err(_) => {
            abort.abort();
            log::warn!(
                "[MEMORY] Extraction for conversation {} timed out after {:?}",
                job.conversation_id,
                timeout
            );
        }
    }
}
