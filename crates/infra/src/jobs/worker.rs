//! Polling worker: selects a job, leases it, runs it, repeats.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, error, info};

use tablejob_core::{HandlerRegistry, JobId, WorkerId};

use super::executor::JobRun;
use super::lease::Lease;
use super::store::{ClaimQuery, JobStore, JobStoreError};
use crate::config::WorkerConfig;

/// Worker loop error.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("storage error while resolving job {job_id}: {source}")]
    Resolution {
        job_id: JobId,
        #[source]
        source: JobStoreError,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    #[error("worker thread panicked")]
    Panicked,
}

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerReport {
    /// Polling iterations, including ones that found nothing.
    pub iterations: u64,
    /// Jobs leased and executed.
    pub jobs_run: u64,
}

/// Handle to control a worker running on its own thread.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<Result<WorkerReport, WorkerError>>>,
}

impl WorkerHandle {
    /// Request a stop and wait for the loop to release its leases and exit.
    pub fn shutdown(self) -> Result<WorkerReport, WorkerError> {
        let _ = self.shutdown.send(());
        self.join()
    }

    /// Wait for the loop to end on its own (a bounded `count`).
    pub fn join(mut self) -> Result<WorkerReport, WorkerError> {
        match self.join.take() {
            Some(j) => j.join().map_err(|_| WorkerError::Panicked)?,
            None => Ok(WorkerReport::default()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

/// A polling worker bound to one queue.
pub struct Worker<S: JobStore> {
    store: S,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    id: WorkerId,
}

impl<S: JobStore> Worker<S> {
    pub fn new(
        store: S,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
        id: WorkerId,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            id,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch up to `batch_size` candidates, shuffle them and lease the first
    /// that can be acquired.
    pub fn next_job(&self) -> Result<Option<Lease<'_, S>>, JobStoreError> {
        let query = ClaimQuery {
            queue: &self.config.queue,
            worker: &self.id,
            max_attempts: self.config.max_attempts,
            limit: self.config.batch_size,
            order: self.config.order,
        };

        let mut candidates = self.store.find_claimable(&query)?;
        candidates.shuffle(&mut rand::thread_rng());

        for job_id in candidates {
            if let Some(lease) = Lease::acquire(&self.store, job_id, &self.id)? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    /// Run until `count` iterations have passed (forever when 0).
    pub fn run(&self) -> Result<WorkerReport, WorkerError> {
        let (_keep_open, stop) = mpsc::channel();
        self.run_until(&stop)
    }

    /// Run until `count` iterations have passed or `stop` fires.
    ///
    /// A message on `stop`, or every sender being dropped, ends the loop at
    /// the next iteration boundary; an idle sleep is cut short.
    pub fn run_until(&self, stop: &mpsc::Receiver<()>) -> Result<WorkerReport, WorkerError> {
        info!(
            worker = %self.id,
            queue = %self.config.queue,
            max_attempts = self.config.max_attempts,
            count = self.config.count,
            "worker starting"
        );

        let mut report = WorkerReport::default();
        let result = loop {
            if !self.config.is_unbounded() && report.iterations >= self.config.count {
                break Ok(());
            }
            if stop_requested(stop) {
                break Ok(());
            }
            report.iterations += 1;

            match self.next_job() {
                Ok(Some(lease)) => {
                    let job_id = lease.job_id();
                    report.jobs_run += 1;
                    match JobRun::new(lease, &self.registry, self.config.max_attempts).run() {
                        Ok(resolution) => {
                            debug!(worker = %self.id, job_id = %job_id, ?resolution, "job resolved");
                        }
                        Err(source) => {
                            error!(worker = %self.id, job_id = %job_id, error = %source, "failed to resolve job");
                            break Err(WorkerError::Resolution { job_id, source });
                        }
                    }
                }
                Ok(None) => {
                    debug!(worker = %self.id, queue = %self.config.queue, "no jobs available; queue may be empty");
                    if sleep_or_stop(stop, self.config.poll_interval) {
                        break Ok(());
                    }
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "failed to select job");
                    if sleep_or_stop(stop, self.config.poll_interval) {
                        break Ok(());
                    }
                }
            }
        };

        self.release_leases();
        info!(
            worker = %self.id,
            jobs_run = report.jobs_run,
            iterations = report.iterations,
            "worker shutting down after running {} jobs, over {} polling iterations",
            report.jobs_run,
            report.iterations
        );

        result.map(|()| report)
    }

    /// Clear every lease held under this worker's identity.
    pub fn release_leases(&self) {
        match self.store.unlock_all(&self.id) {
            Ok(0) => {}
            Ok(released) => info!(worker = %self.id, released, "released held leases"),
            Err(e) => error!(worker = %self.id, error = %e, "failed to release leases"),
        }
    }
}

impl<S: JobStore + 'static> Worker<S> {
    /// Spawn the worker loop on a named background thread.
    pub fn spawn(self) -> Result<WorkerHandle, WorkerError> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(format!("tablejob-{}", self.id))
            .spawn(move || self.run_until(&shutdown_rx))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn stop_requested(stop: &mpsc::Receiver<()>) -> bool {
    matches!(stop.try_recv(), Ok(()) | Err(mpsc::TryRecvError::Disconnected))
}

/// Sleep for `interval` unless a stop arrives first. Returns whether to stop.
fn sleep_or_stop(stop: &mpsc::Receiver<()>, interval: Duration) -> bool {
    match stop.recv_timeout(interval) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}
