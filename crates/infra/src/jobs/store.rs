//! Job storage implementations.
//!
//! Every mutating method is a single conditional update against one row (or
//! one worker's rows): the condition is evaluated and the write applied
//! atomically, so concurrent workers never observe a half-applied change.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use tablejob_core::{Job, JobId, NewJob, QueueStatus, WorkerId};

use crate::config::CandidateOrder;

/// Job store abstraction.
///
/// Implementations must be safe to share between worker threads. "Not found"
/// results of conditional updates are reported as `Ok(None)`/`Ok(false)`,
/// never as errors; errors are reserved for storage failures.
pub trait JobStore: Send + Sync {
    /// Insert a job; the store assigns the id and `created_at`.
    fn insert(&self, job: NewJob) -> Result<JobId, JobStoreError>;

    /// Insert many jobs in one write. Returns the number of rows inserted.
    fn insert_many(&self, jobs: Vec<NewJob>) -> Result<u64, JobStoreError>;

    /// Get a job by id.
    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Serialized handler of a job, if the row exists.
    fn handler_of(&self, id: JobId) -> Result<Option<String>, JobStoreError>;

    /// Completed attempts of a job, if the row exists.
    fn attempts_of(&self, id: JobId) -> Result<Option<u32>, JobStoreError>;

    /// Ids of rows `query.worker` could lease right now, in `query.order`.
    fn find_claimable(&self, query: &ClaimQuery<'_>) -> Result<Vec<JobId>, JobStoreError>;

    /// Lease the row for `worker` if it is not failed and is unlocked or
    /// already held by `worker`. Returns whether exactly one row was updated.
    fn try_lock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError>;

    /// Clear the lease if `worker` holds it. Returns whether a row changed.
    fn unlock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError>;

    /// Clear every lease held by `worker`. Returns the number of rows changed.
    fn unlock_all(&self, worker: &WorkerId) -> Result<u64, JobStoreError>;

    /// Delete the row. Returns whether it existed.
    fn delete(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Count one failed attempt and clear `worker`'s lease in the same write.
    ///
    /// When the new attempt count reaches `max_attempts` the row is marked
    /// failed with `error`. Rows already failed, or leased by another worker,
    /// are left untouched and reported as `None`.
    fn record_failure(
        &self,
        id: JobId,
        worker: &WorkerId,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<FailureRecord>, JobStoreError>;

    /// Count one attempt, push `run_at` to now + `delay` and clear `worker`'s
    /// lease in the same write. Returns the new attempt count, or `None` when
    /// the row is failed or leased by another worker.
    ///
    /// A delay that cannot be added to the current time is a storage error
    /// and leaves the row unchanged.
    fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        delay: Duration,
    ) -> Result<Option<u32>, JobStoreError>;

    /// Aggregate counts for one queue.
    fn status(&self, queue: &str) -> Result<QueueStatus, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Candidate selection for one poll.
#[derive(Debug, Clone)]
pub struct ClaimQuery<'a> {
    pub queue: &'a str,
    pub worker: &'a WorkerId,
    pub max_attempts: u32,
    pub limit: usize,
    pub order: CandidateOrder,
}

/// Row state after [`JobStore::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub attempts: u32,
    /// The row is now permanently failed.
    pub failed: bool,
}

/// In-memory job store for tests/dev.
///
/// One write lock per operation gives the same single-row atomicity the
/// database provides.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    jobs: BTreeMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every row, ordered by id.
    pub fn all(&self) -> Result<Vec<Job>, JobStoreError> {
        Ok(self.read()?.jobs.values().cloned().collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl State {
    fn insert(&mut self, job: NewJob) -> JobId {
        self.next_id += 1;
        let id = JobId::new(self.next_id);
        self.jobs.insert(
            id,
            Job {
                id,
                handler: job.handler,
                queue: job.queue,
                attempts: 0,
                run_at: job.run_at,
                locked_at: None,
                locked_by: None,
                failed_at: None,
                error: None,
                created_at: Utc::now(),
            },
        );
        id
    }
}

fn release_if_held(job: &mut Job, worker: &WorkerId) {
    if job.locked_by.as_ref() == Some(worker) {
        job.locked_at = None;
        job.locked_by = None;
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        Ok(self.write()?.insert(job))
    }

    fn insert_many(&self, jobs: Vec<NewJob>) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let count = jobs.len() as u64;
        for job in jobs {
            state.insert(job);
        }
        Ok(count)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    fn handler_of(&self, id: JobId) -> Result<Option<String>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).map(|j| j.handler.clone()))
    }

    fn attempts_of(&self, id: JobId) -> Result<Option<u32>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).map(|j| j.attempts))
    }

    fn find_claimable(&self, query: &ClaimQuery<'_>) -> Result<Vec<JobId>, JobStoreError> {
        let state = self.read()?;
        let now = Utc::now();

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.queue == query.queue)
            .filter(|j| j.is_claimable_by(query.worker, now, query.max_attempts))
            .collect();

        candidates.sort_by_key(|j| (j.created_at, j.id));
        if query.order == CandidateOrder::NewestFirst {
            candidates.reverse();
        }

        Ok(candidates
            .into_iter()
            .take(query.limit)
            .map(|j| j.id)
            .collect())
    }

    fn try_lock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.is_lockable_by(worker) => {
                job.locked_at = Some(Utc::now());
                job.locked_by = Some(worker.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn unlock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.locked_by.as_ref() == Some(worker) => {
                release_if_held(job, worker);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn unlock_all(&self, worker: &WorkerId) -> Result<u64, JobStoreError> {
        let mut state = self.write()?;
        let mut released = 0;
        for job in state.jobs.values_mut() {
            if job.locked_by.as_ref() == Some(worker) {
                release_if_held(job, worker);
                released += 1;
            }
        }
        Ok(released)
    }

    fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        Ok(self.write()?.jobs.remove(&id).is_some())
    }

    fn record_failure(
        &self,
        id: JobId,
        worker: &WorkerId,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<FailureRecord>, JobStoreError> {
        let mut state = self.write()?;
        let Some(job) = state.jobs.get_mut(&id).filter(|j| j.is_lockable_by(worker)) else {
            return Ok(None);
        };

        job.attempts = job.attempts.saturating_add(1);
        let failed = job.attempts >= max_attempts;
        if failed {
            job.failed_at = Some(Utc::now());
            job.error = Some(error.to_string());
        }
        release_if_held(job, worker);

        Ok(Some(FailureRecord {
            attempts: job.attempts,
            failed,
        }))
    }

    fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        delay: Duration,
    ) -> Result<Option<u32>, JobStoreError> {
        let run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| {
                JobStoreError::Storage(format!("retry delay of {}s out of range", delay.as_secs()))
            })?;

        let mut state = self.write()?;
        let Some(job) = state.jobs.get_mut(&id).filter(|j| j.is_lockable_by(worker)) else {
            return Ok(None);
        };

        job.run_at = Some(run_at);
        job.attempts = job.attempts.saturating_add(1);
        release_if_held(job, worker);

        Ok(Some(job.attempts))
    }

    fn status(&self, queue: &str) -> Result<QueueStatus, JobStoreError> {
        let state = self.read()?;
        let (mut total, mut failed, mut locked) = (0, 0, 0);
        for job in state.jobs.values().filter(|j| j.queue == queue) {
            total += 1;
            if job.is_failed() {
                failed += 1;
            }
            if job.is_locked() {
                locked += 1;
            }
        }
        Ok(QueueStatus::from_counts(total, failed, locked))
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn insert_many(&self, jobs: Vec<NewJob>) -> Result<u64, JobStoreError> {
        (**self).insert_many(jobs)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn handler_of(&self, id: JobId) -> Result<Option<String>, JobStoreError> {
        (**self).handler_of(id)
    }

    fn attempts_of(&self, id: JobId) -> Result<Option<u32>, JobStoreError> {
        (**self).attempts_of(id)
    }

    fn find_claimable(&self, query: &ClaimQuery<'_>) -> Result<Vec<JobId>, JobStoreError> {
        (**self).find_claimable(query)
    }

    fn try_lock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        (**self).try_lock(id, worker)
    }

    fn unlock(&self, id: JobId, worker: &WorkerId) -> Result<bool, JobStoreError> {
        (**self).unlock(id, worker)
    }

    fn unlock_all(&self, worker: &WorkerId) -> Result<u64, JobStoreError> {
        (**self).unlock_all(worker)
    }

    fn delete(&self, id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(id)
    }

    fn record_failure(
        &self,
        id: JobId,
        worker: &WorkerId,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<FailureRecord>, JobStoreError> {
        (**self).record_failure(id, worker, max_attempts, error)
    }

    fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        delay: Duration,
    ) -> Result<Option<u32>, JobStoreError> {
        (**self).reschedule(id, worker, delay)
    }

    fn status(&self, queue: &str) -> Result<QueueStatus, JobStoreError> {
        (**self).status(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::thread;

    fn worker(prefix: &str) -> WorkerId {
        WorkerId::new(prefix, "host")
    }

    fn query<'a>(w: &'a WorkerId) -> ClaimQuery<'a> {
        ClaimQuery {
            queue: "default",
            worker: w,
            max_attempts: 5,
            limit: 10,
            order: CandidateOrder::NewestFirst,
        }
    }

    #[test]
    fn insert_and_lock() {
        let store = InMemoryJobStore::new();
        let a = worker("a");
        let id = store.insert(NewJob::new("noop:null")).unwrap();

        assert_eq!(store.find_claimable(&query(&a)).unwrap(), vec![id]);
        assert!(store.try_lock(id, &a).unwrap());

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.locked_by.as_ref(), Some(&a));
        assert!(job.locked_at.is_some());
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn lease_is_exclusive_but_reentrant() {
        let store = InMemoryJobStore::new();
        let (a, b) = (worker("a"), worker("b"));
        let id = store.insert(NewJob::new("noop:null")).unwrap();

        assert!(store.try_lock(id, &a).unwrap());
        assert!(!store.try_lock(id, &b).unwrap());
        assert!(store.try_lock(id, &a).unwrap());
        assert!(store.find_claimable(&query(&b)).unwrap().is_empty());
        assert_eq!(store.find_claimable(&query(&a)).unwrap(), vec![id]);
    }

    #[test]
    fn unlock_requires_holder() {
        let store = InMemoryJobStore::new();
        let (a, b) = (worker("a"), worker("b"));
        let id = store.insert(NewJob::new("noop:null")).unwrap();
        store.try_lock(id, &a).unwrap();

        assert!(!store.unlock(id, &b).unwrap());
        assert!(store.get(id).unwrap().unwrap().is_locked());
        assert!(store.unlock(id, &a).unwrap());
        assert!(!store.get(id).unwrap().unwrap().is_locked());
        assert!(!store.unlock(id, &a).unwrap());
        assert!(!store.unlock(JobId::new(999), &a).unwrap());
    }

    #[test]
    fn unlock_all_only_touches_own_rows() {
        let store = InMemoryJobStore::new();
        let (a, b) = (worker("a"), worker("b"));
        let ids: Vec<_> = (0..3)
            .map(|i| store.insert(NewJob::new(format!("noop:{i}"))).unwrap())
            .collect();
        store.try_lock(ids[0], &a).unwrap();
        store.try_lock(ids[1], &a).unwrap();
        store.try_lock(ids[2], &b).unwrap();

        assert_eq!(store.unlock_all(&a).unwrap(), 2);
        assert_eq!(store.status("default").unwrap().locked, 1);
        assert_eq!(store.unlock_all(&a).unwrap(), 0);
    }

    #[test]
    fn failure_counts_then_marks_failed() {
        let store = InMemoryJobStore::new();
        let a = worker("a");
        let id = store.insert(NewJob::new("noop:null")).unwrap();

        store.try_lock(id, &a).unwrap();
        let first = store.record_failure(id, &a, 2, "boom").unwrap().unwrap();
        assert_eq!(first, FailureRecord { attempts: 1, failed: false });
        let job = store.get(id).unwrap().unwrap();
        assert!(!job.is_locked());
        assert!(job.error.is_none());

        store.try_lock(id, &a).unwrap();
        let second = store.record_failure(id, &a, 2, "boom").unwrap().unwrap();
        assert_eq!(second, FailureRecord { attempts: 2, failed: true });
        let job = store.get(id).unwrap().unwrap();
        assert!(job.is_failed());
        assert!(!job.is_locked());
        assert_eq!(job.error.as_deref(), Some("boom"));

        // Terminal: no further writes, no further leases.
        assert_eq!(store.record_failure(id, &a, 2, "again").unwrap(), None);
        assert_eq!(store.reschedule(id, &a, Duration::ZERO).unwrap(), None);
        assert!(!store.try_lock(id, &a).unwrap());
        assert_eq!(store.get(id).unwrap().unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn reschedule_pushes_run_at_and_counts_attempt() {
        let store = InMemoryJobStore::new();
        let a = worker("a");
        let id = store.insert(NewJob::new("noop:null")).unwrap();
        store.try_lock(id, &a).unwrap();

        assert_eq!(
            store.reschedule(id, &a, Duration::from_secs(60)).unwrap(),
            Some(1)
        );
        let job = store.get(id).unwrap().unwrap();
        assert!(job.run_at.unwrap() > Utc::now());
        assert!(!job.is_locked());
        assert!(job.error.is_none());
        assert!(store.find_claimable(&query(&a)).unwrap().is_empty());
    }

    #[test]
    fn unrepresentable_delay_is_an_error_not_a_panic() {
        let store = InMemoryJobStore::new();
        let a = worker("a");
        let id = store.insert(NewJob::new("noop:null")).unwrap();
        store.try_lock(id, &a).unwrap();

        let err = store
            .reschedule(id, &a, Duration::from_secs(10_000_000_000_000))
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Storage(_)));

        // Row untouched and the store still usable.
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(job.run_at.is_none());
        assert!(store.unlock(id, &a).unwrap());
    }

    #[test]
    fn resolutions_leave_other_workers_leases_alone() {
        let store = InMemoryJobStore::new();
        let (a, b) = (worker("a"), worker("b"));
        let id = store.insert(NewJob::new("noop:null")).unwrap();
        store.try_lock(id, &a).unwrap();

        assert_eq!(store.record_failure(id, &b, 1, "boom").unwrap(), None);
        assert_eq!(store.reschedule(id, &b, Duration::ZERO).unwrap(), None);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.attempts, 0);
        assert!(!job.is_failed());
        assert_eq!(job.locked_by.as_ref(), Some(&a));
        assert_eq!(
            store.status("default").unwrap(),
            QueueStatus { total: 1, failed: 0, locked: 1, outstanding: 0 }
        );
    }

    #[test]
    fn candidates_follow_order_queue_and_limit() {
        let store = InMemoryJobStore::new();
        let a = worker("a");
        let first = store.insert(NewJob::new("noop:1")).unwrap();
        let second = store.insert(NewJob::new("noop:2")).unwrap();
        store.insert(NewJob::new("noop:3").on_queue("other")).unwrap();

        assert_eq!(store.find_claimable(&query(&a)).unwrap(), vec![second, first]);

        let oldest = ClaimQuery {
            order: CandidateOrder::OldestFirst,
            limit: 1,
            ..query(&a)
        };
        assert_eq!(store.find_claimable(&oldest).unwrap(), vec![first]);
    }

    #[test]
    fn status_counts_per_queue() {
        let store = InMemoryJobStore::new();
        let a = worker("a");
        let locked = store.insert(NewJob::new("noop:1")).unwrap();
        let failed = store.insert(NewJob::new("noop:2")).unwrap();
        store.insert(NewJob::new("noop:3")).unwrap();
        store.insert(NewJob::new("noop:4").on_queue("other")).unwrap();

        store.try_lock(locked, &a).unwrap();
        store.try_lock(failed, &a).unwrap();
        store.record_failure(failed, &a, 1, "boom").unwrap();

        assert_eq!(
            store.status("default").unwrap(),
            QueueStatus { total: 3, failed: 1, locked: 1, outstanding: 1 }
        );
        assert!(store.status("missing").unwrap().is_empty());
    }

    #[test]
    fn bulk_insert_assigns_distinct_ids() {
        let store = InMemoryJobStore::new();
        let n = store
            .insert_many((0..4).map(|i| NewJob::new(format!("noop:{i}"))).collect())
            .unwrap();
        assert_eq!(n, 4);
        let all = store.all().unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn concurrent_lockers_get_exactly_one_lease() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(NewJob::new("noop:null")).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let me = worker(&format!("w{i}"));
                    barrier.wait();
                    store.try_lock(id, &me).unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Lock(u8),
        Unlock(u8),
        Fail(u8),
        Reschedule(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..2).prop_map(Op::Lock),
            (0u8..2).prop_map(Op::Unlock),
            (0u8..2).prop_map(Op::Fail),
            (0u8..2).prop_map(Op::Reschedule),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        /// Attempts never decrease, failure is terminal, and the lease
        /// columns are always set or cleared together.
        #[test]
        fn row_invariants_hold_under_any_interleaving(ops in prop::collection::vec(op(), 1..40)) {
            let store = InMemoryJobStore::new();
            let workers = [worker("a"), worker("b")];
            let id = store.insert(NewJob::new("noop:null")).unwrap();
            let mut last = store.get(id).unwrap().unwrap();

            for op in ops {
                match op {
                    Op::Lock(w) => { store.try_lock(id, &workers[w as usize]).unwrap(); }
                    Op::Unlock(w) => { store.unlock(id, &workers[w as usize]).unwrap(); }
                    Op::Fail(w) => { store.record_failure(id, &workers[w as usize], 3, "boom").unwrap(); }
                    Op::Reschedule(w) => { store.reschedule(id, &workers[w as usize], Duration::ZERO).unwrap(); }
                }

                let now = store.get(id).unwrap().unwrap();
                prop_assert!(now.attempts >= last.attempts);
                prop_assert_eq!(now.locked_at.is_some(), now.locked_by.is_some());
                prop_assert_eq!(now.failed_at.is_some(), now.error.is_some());
                prop_assert!(!(now.is_failed() && now.is_locked()));
                if last.is_failed() {
                    prop_assert_eq!(&now.failed_at, &last.failed_at);
                    prop_assert_eq!(now.attempts, last.attempts);
                    prop_assert!(!now.is_locked() || last.is_locked());
                }
                last = now;
            }
        }
    }
}
