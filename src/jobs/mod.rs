//! Single-flight coordination of image production.
//!
//! Every cache key has at most one [`Job`] in flight. A job is a spawned task
//! running the fetch/resize pipeline together with a shared one-shot channel
//! that broadcasts its outcome to every attached waiter. Waiting is purely
//! observational: a waiter giving up never cancels the job, so other waiters
//! (and later readers of the cache) still benefit from the work.
//!
//! The table of running jobs and the transition "job finished, artifact in the
//! cache" share one lock, so there is no instant where a key that is being
//! produced is visible in neither the table nor the cache.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::{ArtifactCache, CacheKey};
use crate::images::{PipelineError, PipelineErrorKind};

/// Failure recorded on a job. Every waiter attached to the job observes the
/// same value, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProductionError {
    #[error("{message}")]
    Pipeline {
        kind: PipelineErrorKind,
        message: String,
    },

    #[error("Production did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Production crashed: {0}")]
    Crashed(String),

    #[error("Production was abandoned before completing")]
    Abandoned,
}

impl From<PipelineError> for ProductionError {
    fn from(error: PipelineError) -> Self {
        ProductionError::Pipeline {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

pub type JobOutcome = Result<(), ProductionError>;

/// What a waiter saw, see [`Job::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready(JobOutcome),
    DeadlineExceeded,
}

type OutcomeChannel = Shared<oneshot::Receiver<JobOutcome>>;
type JobTable = Arc<Mutex<HashMap<CacheKey, Job>>>;

/// Handle on one in-flight production.
#[derive(Clone)]
pub struct Job {
    id: u64,
    outcome: OutcomeChannel,
}

impl Job {
    /// Wait for the job to reach a terminal state, for at most `deadline`.
    ///
    /// Dropping the returned future or hitting the deadline leaves the
    /// production itself running.
    pub async fn wait(&self, deadline: Duration) -> WaitOutcome {
        match tokio::time::timeout(deadline, self.outcome.clone()).await {
            Ok(Ok(outcome)) => WaitOutcome::Ready(outcome),
            Ok(Err(oneshot::Canceled)) => WaitOutcome::Ready(Err(ProductionError::Abandoned)),
            Err(_) => WaitOutcome::DeadlineExceeded,
        }
    }
}

/// Result of [`JobCoordinator::ensure`].
pub enum Ensured {
    /// The artifact is already cached, nothing was scheduled.
    Cached,
    /// Attached to a job somebody else started.
    Joined(Job),
    /// A new job was started for this caller.
    Started(Job),
}

impl Ensured {
    pub fn job(&self) -> Option<&Job> {
        match self {
            Ensured::Cached => None,
            Ensured::Joined(job) | Ensured::Started(job) => Some(job),
        }
    }
}

#[derive(Clone)]
pub struct JobCoordinator {
    cache: ArtifactCache,
    jobs: JobTable,
    next_id: Arc<AtomicU64>,
    production_timeout: Duration,
}

impl JobCoordinator {
    pub fn new(cache: ArtifactCache, production_timeout: Duration) -> Self {
        Self {
            cache,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            production_timeout,
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Make sure the artifact for `key` is either cached or being produced.
    ///
    /// `producer` is only invoked when a new job has to be started, and then
    /// runs on a spawned task bounded by the production timeout, independent
    /// of the caller. Must be called from within a tokio runtime.
    pub fn ensure<F, Fut>(&self, key: &CacheKey, producer: F) -> Ensured
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, PipelineError>> + Send + 'static,
    {
        let (job, completion) = {
            let mut jobs = self.jobs.lock();

            if self.cache.contains(key) {
                return Ensured::Cached;
            }

            if let Some(job) = jobs.get(key) {
                log::debug!("Joining in-flight job for {}", key);
                return Ensured::Joined(job.clone());
            }

            let (sender, receiver) = oneshot::channel();
            let job = Job {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                outcome: receiver.shared(),
            };
            jobs.insert(key.clone(), job.clone());

            let completion = Completion {
                key: key.clone(),
                id: job.id,
                jobs: self.jobs.clone(),
                cache: self.cache.clone(),
                sender: Some(sender),
            };
            (job, completion)
        };
        // Spawned outside the lock: if spawning fails, dropping `completion`
        // needs the table lock to settle the job.
        let timeout = self.production_timeout;

        log::info!("Starting job for {}", key);
        tokio::spawn(async move {
            // The producer is invoked inside the guarded future so a panic while
            // building it is caught as well.
            let production = AssertUnwindSafe(async move { producer().await }).catch_unwind();

            let result = match tokio::time::timeout(timeout, production).await {
                Ok(Ok(Ok(data))) => Ok(data),
                Ok(Ok(Err(err))) => Err(ProductionError::from(err)),
                Ok(Err(panic)) => Err(ProductionError::Crashed(panic_message(panic.as_ref()))),
                Err(_) => Err(ProductionError::TimedOut(timeout)),
            };
            completion.finish(result);
        });

        Ensured::Started(job)
    }

    /// The in-flight job for `key`, if any.
    pub fn lookup(&self, key: &CacheKey) -> Option<Job> {
        self.jobs.lock().get(key).cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.lock().len()
    }
}

/// Settles a job exactly once: on the normal path through [`Completion::finish`],
/// otherwise when the spawned task is dropped without finishing.
struct Completion {
    key: CacheKey,
    id: u64,
    jobs: JobTable,
    cache: ArtifactCache,
    sender: Option<oneshot::Sender<JobOutcome>>,
}

impl Completion {
    fn finish(mut self, result: Result<Vec<u8>, ProductionError>) {
        self.settle(result);
    }

    fn settle(&mut self, result: Result<Vec<u8>, ProductionError>) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        let outcome = {
            let mut jobs = self.jobs.lock();
            let outcome = match result {
                Ok(data) => {
                    self.cache.put(self.key.clone(), Arc::from(data));
                    Ok(())
                }
                Err(err) => Err(err),
            };
            if jobs.get(&self.key).is_some_and(|job| job.id == self.id) {
                jobs.remove(&self.key);
            }
            outcome
        };

        match &outcome {
            Ok(()) => log::info!("Job for {} completed", self.key),
            Err(ProductionError::Crashed(message)) => {
                log::error!("Job for {} crashed: {}", self.key, message)
            }
            Err(err) => log::warn!("Job for {} failed: {}", self.key, err),
        }

        // Nobody may be listening anymore, that's fine.
        sender.send(outcome).ok();
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.settle(Err(ProductionError::Abandoned));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Semaphore;

    use super::*;

    /// Counts how often production actually ran and lets the test decide when
    /// it may finish.
    #[derive(Clone)]
    struct TestProducer {
        runs: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
    }

    impl TestProducer {
        fn new() -> Self {
            Self {
                runs: Default::default(),
                gate: Arc::new(Semaphore::new(0)),
            }
        }

        fn open(&self) {
            self.gate.add_permits(1000);
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn succeed(
            &self,
            data: &'static [u8],
        ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<Vec<u8>, PipelineError>>
        {
            let this = self.clone();
            move || {
                this.runs.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    let _permit = this.gate.acquire().await.unwrap();
                    Ok(data.to_vec())
                })
            }
        }

        fn fail(
            &self,
        ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<Vec<u8>, PipelineError>>
        {
            let this = self.clone();
            move || {
                this.runs.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    let _permit = this.gate.acquire().await.unwrap();
                    Err(PipelineError::DecodeError("bad pixels".into()))
                })
            }
        }
    }

    fn coordinator() -> JobCoordinator {
        JobCoordinator::new(ArtifactCache::new(16), Duration::from_secs(30))
    }

    fn key() -> CacheKey {
        CacheKey::derive("https://example.com/a.jpg", 10, 10)
    }

    #[tokio::test]
    async fn test_concurrent_ensures_share_one_job() {
        let coordinator = coordinator();
        let producer = TestProducer::new();

        let mut jobs = Vec::new();
        let mut started = 0;
        for _ in 0..8 {
            match coordinator.ensure(&key(), producer.succeed(b"pixels")) {
                Ensured::Started(job) => {
                    started += 1;
                    jobs.push(job);
                }
                Ensured::Joined(job) => jobs.push(job),
                Ensured::Cached => panic!("nothing should be cached yet"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(coordinator.in_flight(), 1);

        producer.open();
        for job in &jobs {
            assert_eq!(
                job.wait(Duration::from_secs(5)).await,
                WaitOutcome::Ready(Ok(()))
            );
        }

        assert_eq!(producer.runs(), 1);
        assert_eq!(coordinator.in_flight(), 0);
        assert_eq!(
            coordinator.cache().get(&key()).as_deref(),
            Some(&b"pixels"[..])
        );
    }

    #[tokio::test]
    async fn test_cached_key_schedules_nothing() {
        let coordinator = coordinator();
        coordinator.cache().put(key(), Arc::from(&b"pixels"[..]));
        let producer = TestProducer::new();

        assert!(matches!(
            coordinator.ensure(&key(), producer.succeed(b"other")),
            Ensured::Cached
        ));
        tokio::task::yield_now().await;
        assert_eq!(producer.runs(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let coordinator = coordinator();
        let producer = TestProducer::new();

        let first = coordinator.ensure(&key(), producer.fail());
        let second = coordinator.ensure(&key(), producer.fail());
        assert!(matches!(second, Ensured::Joined(_)));

        producer.open();
        let expected = WaitOutcome::Ready(Err(ProductionError::Pipeline {
            kind: PipelineErrorKind::Decode,
            message: "Decode error: bad pixels".into(),
        }));
        assert_eq!(first.job().unwrap().wait(Duration::from_secs(5)).await, expected);
        assert_eq!(second.job().unwrap().wait(Duration::from_secs(5)).await, expected);
        assert!(coordinator.cache().is_empty());
        assert_eq!(coordinator.in_flight(), 0);

        // the next request starts over instead of replaying the failure
        let retry = coordinator.ensure(&key(), producer.succeed(b"pixels"));
        assert!(matches!(retry, Ensured::Started(_)));
        assert_eq!(
            retry.job().unwrap().wait(Duration::from_secs(5)).await,
            WaitOutcome::Ready(Ok(()))
        );
        assert_eq!(producer.runs(), 2);
    }

    #[tokio::test]
    async fn test_waiter_deadline_does_not_cancel_production() {
        let coordinator = coordinator();
        let producer = TestProducer::new();

        let ensured = coordinator.ensure(&key(), producer.succeed(b"pixels"));
        let job = ensured.job().unwrap().clone();
        let patient = job.clone();

        assert_eq!(
            job.wait(Duration::from_millis(20)).await,
            WaitOutcome::DeadlineExceeded
        );

        producer.open();
        assert_eq!(
            patient.wait(Duration::from_secs(5)).await,
            WaitOutcome::Ready(Ok(()))
        );
        assert!(coordinator.cache().contains(&key()));
    }

    #[tokio::test]
    async fn test_panicking_producer_releases_waiters() {
        let coordinator = coordinator();

        let ensured = coordinator.ensure(&key(), || async {
            if !key().as_str().is_empty() {
                panic!("decoder exploded");
            }
            Ok(Vec::new())
        });

        let outcome = ensured.job().unwrap().wait(Duration::from_secs(5)).await;
        assert_eq!(
            outcome,
            WaitOutcome::Ready(Err(ProductionError::Crashed("decoder exploded".into())))
        );
        assert_eq!(coordinator.in_flight(), 0);
        assert!(coordinator.lookup(&key()).is_none());
    }

    #[tokio::test]
    async fn test_production_timeout_is_recorded() {
        let coordinator = JobCoordinator::new(ArtifactCache::new(4), Duration::from_millis(20));
        let producer = TestProducer::new();

        let ensured = coordinator.ensure(&key(), producer.succeed(b"never"));
        let outcome = ensured.job().unwrap().wait(Duration::from_secs(5)).await;

        assert_eq!(
            outcome,
            WaitOutcome::Ready(Err(ProductionError::TimedOut(Duration::from_millis(20))))
        );
        assert!(coordinator.cache().is_empty());
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cache_is_populated_before_waiters_wake() {
        let coordinator = coordinator();
        let producer = TestProducer::new();

        let ensured = coordinator.ensure(&key(), producer.succeed(b"pixels"));
        producer.open();

        assert_eq!(
            ensured.job().unwrap().wait(Duration::from_secs(5)).await,
            WaitOutcome::Ready(Ok(()))
        );
        assert!(coordinator.lookup(&key()).is_none());
        assert!(coordinator.cache().get(&key()).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_ensures_start_exactly_one_job() {
        for round in 0..20 {
            let coordinator = coordinator();
            let producer = TestProducer::new();
            let key = CacheKey::derive(&format!("https://example.com/{}.jpg", round), 10, 10);

            let tasks: Vec<_> = (0..32)
                .map(|_| {
                    let coordinator = coordinator.clone();
                    let key = key.clone();
                    let succeed = producer.succeed(b"pixels");
                    tokio::spawn(async move {
                        match coordinator.ensure(&key, succeed) {
                            Ensured::Started(job) => (true, job),
                            Ensured::Joined(job) => (false, job),
                            Ensured::Cached => panic!("gate is closed, nothing can be cached"),
                        }
                    })
                })
                .collect();

            let mut started = 0;
            let mut jobs = Vec::new();
            for task in tasks {
                let (is_new, job) = task.await.unwrap();
                started += is_new as usize;
                jobs.push(job);
            }
            assert_eq!(started, 1);

            producer.open();
            for job in jobs {
                assert_eq!(
                    job.wait(Duration::from_secs(5)).await,
                    WaitOutcome::Ready(Ok(()))
                );
            }
            assert_eq!(producer.runs(), 1);
            assert_eq!(coordinator.in_flight(), 0);
        }
    }

    #[test]
    fn test_ensure_outside_runtime_panics_without_leaking_the_job() {
        let coordinator = coordinator();

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            coordinator.ensure(&key(), || async { Ok(b"pixels".to_vec()) });
        }));

        assert!(result.is_err());
        assert_eq!(coordinator.in_flight(), 0);
        assert!(coordinator.cache().is_empty());
    }
}
