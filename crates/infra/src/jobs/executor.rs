//! Job executor: runs one leased job and resolves it.
//!
//! Handler outcomes (including panics and undecodable payloads) are always
//! turned into a lease resolution. Only storage errors escape to the caller.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tablejob_core::{HandlerOutcome, HandlerRegistry, JobHandler, JobId, RetryLater};

use super::lease::Lease;
use super::store::{JobStore, JobStoreError};

/// How a job run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResolution {
    /// Handler succeeded; the row was deleted.
    Succeeded,
    /// Handler asked to be retried; the row is eligible again after `delay`.
    RetryScheduled { attempts: u32, delay: Duration },
    /// The attempt failed. `exhausted` means the row is now permanently failed.
    Failed {
        message: String,
        attempts: Option<u32>,
        exhausted: bool,
    },
}

impl JobResolution {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One execution of a leased job.
pub struct JobRun<'a, S: JobStore + ?Sized> {
    lease: Lease<'a, S>,
    registry: &'a HandlerRegistry,
    max_attempts: u32,
}

impl<'a, S: JobStore + ?Sized> JobRun<'a, S> {
    pub fn new(lease: Lease<'a, S>, registry: &'a HandlerRegistry, max_attempts: u32) -> Self {
        Self {
            lease,
            registry,
            max_attempts,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.lease.job_id()
    }

    /// Load the handler, run it once and resolve the lease from its outcome.
    pub fn run(self) -> Result<JobResolution, JobStoreError> {
        let job_id = self.lease.job_id();

        let mut handler = match self.load_handler()? {
            Ok(handler) => handler,
            Err(message) => {
                // Nothing to notify: there is no handler instance.
                error!(job_id = %job_id, error = %message, "cannot restore job handler");
                let record = self.lease.finish_with_error(self.max_attempts, &message)?;
                return Ok(JobResolution::Failed {
                    message,
                    attempts: record.map(|r| r.attempts),
                    exhausted: record.is_some_and(|r| r.failed),
                });
            }
        };

        info!(job_id = %job_id, worker = %self.lease.worker(), "running job");

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.perform())) {
            Ok(outcome) => outcome,
            Err(panic) => HandlerOutcome::failed(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        };

        match outcome {
            HandlerOutcome::Success => {
                self.lease.finish()?;
                Ok(JobResolution::Succeeded)
            }
            HandlerOutcome::RetryRequested(retry) => self.resolve_retry(handler, retry),
            HandlerOutcome::Failed { message } => self.resolve_failure(handler, message),
        }
    }

    /// `Ok(Err(message))` when the payload is missing or cannot be decoded.
    fn load_handler(&self) -> Result<Result<Box<dyn JobHandler>, String>, JobStoreError> {
        let job_id = self.lease.job_id();
        let Some(payload) = self.lease.store().handler_of(job_id)? else {
            return Ok(Err(format!("bad handler for job::{job_id}: job row not found")));
        };

        Ok(self
            .registry
            .decode(&payload)
            .map_err(|e| format!("bad handler for job::{job_id}: {e}")))
    }

    fn resolve_retry(
        self,
        mut handler: Box<dyn JobHandler>,
        retry: RetryLater,
    ) -> Result<JobResolution, JobStoreError> {
        let job_id = self.lease.job_id();
        let attempts_so_far = self.lease.store().attempts_of(job_id)?.unwrap_or(0);
        let attempt = attempts_so_far.saturating_add(1);
        let message = format!(
            "Caught retry request \"{}\" on attempt {}/{}.",
            retry.message, attempt, self.max_attempts
        );

        if attempt >= self.max_attempts {
            let message = format!("{message} Giving up.");
            warn!(job_id = %job_id, attempt, "{message}");
            let record = self.lease.finish_with_error(self.max_attempts, &message)?;
            let exhausted = record.is_some_and(|r| r.failed);
            if exhausted {
                notify_final_failure(handler.as_mut(), job_id, &message);
            }
            return Ok(JobResolution::Failed {
                message,
                attempts: record.map(|r| r.attempts),
                exhausted,
            });
        }

        info!(
            job_id = %job_id,
            attempt,
            "{message} Try again in {} seconds.",
            retry.delay_secs()
        );
        let delay = retry.bounded_delay();
        match self.lease.retry_later(delay)? {
            Some(attempts) => Ok(JobResolution::RetryScheduled { attempts, delay }),
            None => Ok(JobResolution::Failed {
                message,
                attempts: None,
                exhausted: false,
            }),
        }
    }

    fn resolve_failure(
        self,
        mut handler: Box<dyn JobHandler>,
        message: String,
    ) -> Result<JobResolution, JobStoreError> {
        let job_id = self.lease.job_id();
        let record = self.lease.finish_with_error(self.max_attempts, &message)?;
        let exhausted = record.is_some_and(|r| r.failed);
        if exhausted {
            notify_final_failure(handler.as_mut(), job_id, &message);
        }
        Ok(JobResolution::Failed {
            message,
            attempts: record.map(|r| r.attempts),
            exhausted,
        })
    }
}

fn notify_final_failure(handler: &mut dyn JobHandler, job_id: JobId, message: &str) {
    debug!(job_id = %job_id, "notifying handler of final failure");
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler.on_final_failure(message))) {
        error!(
            job_id = %job_id,
            error = %panic_message(panic.as_ref()),
            "final failure hook panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tablejob_core::{MAX_RETRY_DELAY, NewJob, TypedJob, WorkerId, payload};

    static FINAL_FAILURES: AtomicUsize = AtomicUsize::new(0);
    static LAST_FINAL_ERROR: Mutex<String> = Mutex::new(String::new());

    #[derive(Serialize, Deserialize)]
    struct Outcome {
        kind: String,
        #[serde(default)]
        tag: String,
    }

    impl JobHandler for Outcome {
        fn perform(&mut self) -> HandlerOutcome {
            match self.kind.as_str() {
                "ok" => HandlerOutcome::success(),
                "retry" => RetryLater::new("busy").with_delay(Duration::ZERO).into(),
                "far" => HandlerOutcome::retry(RetryLater {
                    message: "much later".to_string(),
                    delay: Duration::from_secs(10_000_000_000_000),
                }),
                "panic" => panic!("kaboom"),
                _ => HandlerOutcome::failed("nope"),
            }
        }

        fn on_final_failure(&mut self, error: &str) {
            if self.tag == "notify" {
                FINAL_FAILURES.fetch_add(1, Ordering::SeqCst);
                *LAST_FINAL_ERROR.lock().unwrap() = error.to_string();
            }
        }
    }

    impl TypedJob for Outcome {
        const TYPE: &'static str = "test.outcome";
    }

    fn setup(kind: &str, tag: &str) -> (InMemoryJobStore, HandlerRegistry, JobId) {
        let store = InMemoryJobStore::new();
        let registry = HandlerRegistry::new().with::<Outcome>().unwrap();
        let payload = payload::encode(&Outcome {
            kind: kind.to_string(),
            tag: tag.to_string(),
        })
        .unwrap();
        let id = store.insert(NewJob::new(payload)).unwrap();
        (store, registry, id)
    }

    fn run_once(
        store: &InMemoryJobStore,
        registry: &HandlerRegistry,
        id: JobId,
        max_attempts: u32,
    ) -> JobResolution {
        let worker = WorkerId::new("exec", "host");
        let lease = Lease::acquire(store, id, &worker).unwrap().unwrap();
        JobRun::new(lease, registry, max_attempts).run().unwrap()
    }

    #[test]
    fn success_deletes_job() {
        let (store, registry, id) = setup("ok", "");
        assert_eq!(run_once(&store, &registry, id, 5), JobResolution::Succeeded);
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn failure_counts_attempt_and_releases() {
        let (store, registry, id) = setup("fail", "");
        let resolution = run_once(&store, &registry, id, 5);
        assert_eq!(
            resolution,
            JobResolution::Failed {
                message: "nope".to_string(),
                attempts: Some(1),
                exhausted: false
            }
        );
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(!job.is_locked());
        assert!(job.error.is_none());
    }

    #[test]
    fn last_failure_marks_failed() {
        let (store, registry, id) = setup("fail", "");
        run_once(&store, &registry, id, 2);
        let resolution = run_once(&store, &registry, id, 2);
        assert!(matches!(resolution, JobResolution::Failed { exhausted: true, .. }));

        let job = store.get(id).unwrap().unwrap();
        assert!(job.is_failed());
        assert_eq!(job.error.as_deref(), Some("nope"));
    }

    #[test]
    fn retry_reschedules_without_error() {
        let (store, registry, id) = setup("retry", "");
        let resolution = run_once(&store, &registry, id, 5);
        assert_eq!(
            resolution,
            JobResolution::RetryScheduled {
                attempts: 1,
                delay: Duration::ZERO
            }
        );
        let job = store.get(id).unwrap().unwrap();
        assert!(job.run_at.is_some());
        assert!(job.error.is_none());
        assert!(!job.is_locked());
    }

    #[test]
    fn retry_on_last_attempt_gives_up_and_notifies() {
        let (store, registry, id) = setup("retry", "notify");
        let before = FINAL_FAILURES.load(Ordering::SeqCst);

        let resolution = run_once(&store, &registry, id, 1);
        let JobResolution::Failed { message, exhausted, .. } = resolution else {
            panic!("expected failure, got {resolution:?}");
        };
        assert!(exhausted);
        assert_eq!(
            message,
            "Caught retry request \"busy\" on attempt 1/1. Giving up."
        );

        let job = store.get(id).unwrap().unwrap();
        assert!(job.is_failed());
        assert_eq!(job.error.as_deref(), Some(message.as_str()));
        assert!(FINAL_FAILURES.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn final_failure_hook_sees_error() {
        let (store, registry, id) = setup("fail", "notify");
        run_once(&store, &registry, id, 1);
        assert_eq!(*LAST_FINAL_ERROR.lock().unwrap(), "nope");
    }

    #[test]
    fn panic_is_a_failure() {
        let (store, registry, id) = setup("panic", "");
        let resolution = run_once(&store, &registry, id, 5);
        let JobResolution::Failed { message, .. } = resolution else {
            panic!("expected failure, got {resolution:?}");
        };
        assert!(message.contains("kaboom"));
        assert_eq!(store.get(id).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn undecodable_payload_fails_the_job() {
        let store = InMemoryJobStore::new();
        let registry = HandlerRegistry::new().with::<Outcome>().unwrap();
        let id = store.insert(NewJob::new("unknown.type:{}")).unwrap();

        let resolution = run_once(&store, &registry, id, 1);
        let JobResolution::Failed { message, exhausted, .. } = resolution else {
            panic!("expected failure, got {resolution:?}");
        };
        assert!(exhausted);
        assert!(message.starts_with(&format!("bad handler for job::{id}")));
        assert!(store.get(id).unwrap().unwrap().is_failed());
    }

    #[test]
    fn out_of_range_retry_delay_is_clamped() {
        let (store, registry, id) = setup("far", "");
        let resolution = run_once(&store, &registry, id, 5);
        assert_eq!(
            resolution,
            JobResolution::RetryScheduled {
                attempts: 1,
                delay: MAX_RETRY_DELAY
            }
        );

        let job = store.get(id).unwrap().unwrap();
        assert!(!job.is_locked());
        assert!(job.run_at.unwrap() > chrono::Utc::now());
        assert_eq!(store.status("default").unwrap().total, 1);
    }
}
