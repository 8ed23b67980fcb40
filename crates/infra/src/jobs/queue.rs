//! Producer-side facade: enqueue typed jobs and read queue status.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use tablejob_core::{Job, JobId, NewJob, PayloadError, QueueStatus, TypedJob, payload};

use super::store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Enqueue and inspect jobs on any [`JobStore`].
#[derive(Debug, Clone)]
pub struct JobQueue<S: JobStore> {
    store: S,
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Serialize `job` and insert it on `queue`, eligible from `run_at`
    /// (immediately when `None`).
    #[instrument(skip(self, job), fields(job_type = T::TYPE), err)]
    pub fn enqueue<T: TypedJob>(
        &self,
        job: &T,
        queue: &str,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<JobId, EnqueueError> {
        let mut new_job = NewJob::new(payload::encode(job)?).on_queue(queue);
        new_job.run_at = run_at;
        let id = self.store.insert(new_job)?;
        debug!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Insert every job in one write.
    #[instrument(skip(self, jobs), fields(job_type = T::TYPE, job_count = jobs.len()), err)]
    pub fn bulk_enqueue<T: TypedJob>(
        &self,
        jobs: &[T],
        queue: &str,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<u64, EnqueueError> {
        let rows = jobs
            .iter()
            .map(|job| {
                Ok(NewJob {
                    handler: payload::encode(job)?,
                    queue: queue.to_string(),
                    run_at,
                })
            })
            .collect::<Result<Vec<_>, PayloadError>>()?;

        if rows.is_empty() {
            return Ok(0);
        }
        Ok(self.store.insert_many(rows)?)
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(id)
    }

    /// Aggregate counts for `queue`.
    pub fn status(&self, queue: &str) -> Result<QueueStatus, JobStoreError> {
        self.store.status(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use chrono::Duration;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use tablejob_core::{HandlerOutcome, JobHandler, WorkerId};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    impl JobHandler for Email {
        fn perform(&mut self) -> HandlerOutcome {
            HandlerOutcome::success()
        }
    }

    impl TypedJob for Email {
        const TYPE: &'static str = "mail.send";
    }

    #[test]
    fn enqueue_stores_payload_queue_and_run_at() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let at = Utc::now() + Duration::hours(1);

        let id = queue
            .enqueue(&Email { to: "a@b".into() }, "mail", Some(at))
            .unwrap();

        let job = queue.get(id).unwrap().unwrap();
        assert_eq!(job.handler, r#"mail.send:{"to":"a@b"}"#);
        assert_eq!(job.queue, "mail");
        assert_eq!(job.run_at, Some(at));
        assert_eq!(job.attempts, 0);
        assert!(!job.is_locked());
    }

    #[test]
    fn bulk_enqueue_inserts_all() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let jobs: Vec<_> = (0..3).map(|i| Email { to: format!("{i}@x") }).collect();

        assert_eq!(queue.bulk_enqueue(&jobs, "mail", None).unwrap(), 3);
        assert_eq!(queue.bulk_enqueue::<Email>(&[], "mail", None).unwrap(), 0);
        assert_eq!(queue.status("mail").unwrap().total, 3);
    }

    #[test]
    fn bulk_enqueued_jobs_are_all_outstanding() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let jobs: Vec<_> = (0..3).map(|i| Email { to: format!("{i}@x") }).collect();

        queue.bulk_enqueue(&jobs, "default", None).unwrap();

        assert_eq!(
            queue.status("default").unwrap(),
            QueueStatus { total: 3, outstanding: 3, locked: 0, failed: 0 }
        );
    }

    #[test]
    fn empty_queue_reports_zeroes() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        assert_eq!(queue.status("default").unwrap(), QueueStatus::default());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        /// outstanding + locked + failed == total for any mix of row states.
        #[test]
        fn status_arithmetic_holds(states in prop::collection::vec(0u8..3, 0..40)) {
            let store = InMemoryJobStore::arc();
            let queue = JobQueue::new(store.clone());
            let w = WorkerId::new("p", "host");

            for state in &states {
                let id = queue.enqueue(&Email { to: "x".into() }, "default", None).unwrap();
                match state {
                    1 => { store.try_lock(id, &w).unwrap(); }
                    2 => { store.record_failure(id, &w, 1, "boom").unwrap(); }
                    _ => {}
                }
            }

            let status = queue.status("default").unwrap();
            prop_assert_eq!(status.total, states.len() as u64);
            prop_assert_eq!(status.locked, states.iter().filter(|s| **s == 1).count() as u64);
            prop_assert_eq!(status.failed, states.iter().filter(|s| **s == 2).count() as u64);
            prop_assert_eq!(status.outstanding + status.locked + status.failed, status.total);
        }
    }
}
