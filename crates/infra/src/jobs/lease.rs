//! The lease protocol.
//!
//! A [`Lease`] is proof that this worker's identity was written into the
//! row's lock columns. Every resolution consumes the lease, so a job is
//! finished, failed, rescheduled or released exactly once per acquisition.

use std::time::Duration;

use tracing::{debug, info, warn};

use tablejob_core::{JobId, WorkerId};

use super::store::{FailureRecord, JobStore, JobStoreError};

/// A held lease on one job row.
#[derive(Debug)]
#[must_use = "a lease must be resolved or released"]
pub struct Lease<'a, S: JobStore + ?Sized> {
    store: &'a S,
    job_id: JobId,
    worker: &'a WorkerId,
}

impl<'a, S: JobStore + ?Sized> Lease<'a, S> {
    /// Write `worker` into the row's lock columns.
    ///
    /// Succeeds when the row exists, is not failed, and is unlocked or
    /// already held by `worker`. Losing the race is `Ok(None)`, not an error.
    pub fn acquire(
        store: &'a S,
        job_id: JobId,
        worker: &'a WorkerId,
    ) -> Result<Option<Self>, JobStoreError> {
        info!(job_id = %job_id, worker = %worker, "attempting to acquire lock");

        if store.try_lock(job_id, worker)? {
            Ok(Some(Self {
                store,
                job_id,
                worker,
            }))
        } else {
            debug!(job_id = %job_id, worker = %worker, "failed to acquire lock");
            Ok(None)
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn worker(&self) -> &WorkerId {
        self.worker
    }

    pub(crate) fn store(&self) -> &'a S {
        self.store
    }

    /// Give the row back without recording anything.
    ///
    /// A no-op when the lock is no longer ours.
    pub fn release(self) -> Result<bool, JobStoreError> {
        debug!(job_id = %self.job_id, worker = %self.worker, "releasing lock");
        let released = self.store.unlock(self.job_id, self.worker)?;
        if !released {
            debug!(job_id = %self.job_id, worker = %self.worker, "lock no longer held");
        }
        Ok(released)
    }

    /// The job succeeded: delete the row.
    pub fn finish(self) -> Result<(), JobStoreError> {
        info!(job_id = %self.job_id, worker = %self.worker, "completed job");
        if !self.store.delete(self.job_id)? {
            warn!(job_id = %self.job_id, "finished job was already gone");
        }
        Ok(())
    }

    /// Count a failed attempt; mark the job failed once `max_attempts` is
    /// reached. Clears the lease in the same write.
    pub fn finish_with_error(
        self,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<FailureRecord>, JobStoreError> {
        warn!(job_id = %self.job_id, worker = %self.worker, error = %error, "job failed");

        let record = self
            .store
            .record_failure(self.job_id, self.worker, max_attempts, error)?;

        match record {
            Some(FailureRecord { failed: true, attempts }) => {
                warn!(job_id = %self.job_id, attempts, "job permanently failed");
            }
            Some(FailureRecord { attempts, .. }) => {
                debug!(job_id = %self.job_id, attempts, max_attempts, "failure recorded");
            }
            None => {
                warn!(job_id = %self.job_id, "failure not recorded; job missing or already failed");
            }
        }
        Ok(record)
    }

    /// Count an attempt and make the job eligible again after `delay`.
    /// Clears the lease in the same write.
    pub fn retry_later(self, delay: Duration) -> Result<Option<u32>, JobStoreError> {
        let attempts = self.store.reschedule(self.job_id, self.worker, delay)?;
        match attempts {
            Some(attempts) => info!(
                job_id = %self.job_id,
                attempts,
                delay_secs = delay.as_secs(),
                "job rescheduled"
            ),
            None => warn!(job_id = %self.job_id, "retry not recorded; job missing or already failed"),
        }
        Ok(attempts)
    }
}
