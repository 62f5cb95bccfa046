//! Bounded fan-out of a fixed set of fallible jobs
//!
//! `run_parallel` starts every job on its own tokio task and returns on the
//! first terminal event: all jobs succeeded, one job failed, or the
//! `JobContext` was canceled or hit its deadline. Cancellation is cooperative.
//! Jobs still running when the group terminates are detached, not aborted;
//! their results are dropped. Jobs that hold expensive resources can select on
//! `JobContext::token()` to stop early.
//!
//! When several jobs fail at about the same time, which error is returned is
//! decided by whichever report reaches the channel first. Callers must not
//! rely on a particular job's error winning.

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A zero-argument job; its useful output goes through a side channel such as a `Slot`
pub type Job<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

/// Boxes a future into a `Job`
pub fn job<F, E>(future: F) -> Job<E>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
{
    Box::pin(future)
}

/// Why a context stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// `cancel` was called on the context or one of its parents
    #[error("context canceled")]
    Canceled,

    /// The context deadline elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal plus an optional deadline
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for JobContext {
    fn default() -> Self {
        Self::background()
    }
}

impl JobContext {
    /// A context that is never done unless canceled
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now
    ///
    /// A timeout too large to represent as an instant never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// A context that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A child context canceled together with this one
    ///
    /// The child keeps the parent's deadline, tightened to `timeout` from now
    /// when given.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.and_then(|t| Instant::now().checked_add(t));
        let deadline = match (self.deadline, own) {
            (Some(parent), Some(own)) => Some(parent.min(own)),
            (parent, own) => parent.or(own),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Cancels this context and every child
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The token jobs can select on to stop early
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// When the context expires, if it has a deadline
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns why the context is done, or `None` while it is still live
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            Some(ContextError::Canceled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is canceled or its deadline elapses
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }
}

/// Outcome of a failed fan-out
#[derive(Debug, Error)]
pub enum ParallelError<E> {
    /// A job returned an error
    #[error("job {index} failed: {source}")]
    Job {
        index: usize,
        #[source]
        source: E,
    },

    /// A job panicked before reporting
    #[error("job {index} panicked")]
    Panicked { index: usize },

    /// The context ended before every job finished
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl<E> ParallelError<E> {
    /// Returns the job error, if the group failed because of one
    pub fn into_job_error(self) -> Option<E> {
        match self {
            ParallelError::Job { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Terminal report of a single job
enum JobReport<E> {
    Succeeded,
    Failed(E),
    Panicked,
}

/// Runs every job concurrently and waits for the first terminal event
///
/// Returns `Ok(())` once all jobs succeed, the first job error otherwise, or
/// the context error if the context ends first. Returns immediately without
/// starting anything when `jobs` is empty or the context is already done.
///
/// Must be called from within a tokio runtime.
pub async fn run_parallel<E>(ctx: &JobContext, jobs: Vec<Job<E>>) -> Result<(), ParallelError<E>>
where
    E: Send + 'static,
{
    if let Some(reason) = ctx.err() {
        return Err(reason.into());
    }

    let total = jobs.len();
    if total == 0 {
        return Ok(());
    }

    // One slot per job so late reporters never block on a dropped group
    let (report_tx, mut report_rx) = mpsc::channel::<(usize, JobReport<E>)>(total);

    for (index, job) in jobs.into_iter().enumerate() {
        let report_tx = report_tx.clone();
        tokio::spawn(async move {
            let report = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => JobReport::Succeeded,
                Ok(Err(e)) => JobReport::Failed(e),
                Err(_) => JobReport::Panicked,
            };
            let _ = report_tx.send((index, report)).await;
        });
    }
    drop(report_tx);

    let done = ctx.done();
    tokio::pin!(done);

    let mut remaining = total;
    loop {
        tokio::select! {
            reason = &mut done => {
                debug!(remaining, %reason, "fan-out abandoned");
                return Err(reason.into());
            }
            report = report_rx.recv() => match report {
                Some((_, JobReport::Succeeded)) => {
                    remaining -= 1;
                    if remaining == 0 {
                        return Ok(());
                    }
                }
                Some((index, JobReport::Failed(source))) => {
                    debug!(index, remaining, "fan-out job failed");
                    return Err(ParallelError::Job { index, source });
                }
                Some((index, JobReport::Panicked)) => {
                    return Err(ParallelError::Panicked { index });
                }
                // Every sender is gone only if the runtime dropped a task unreported
                None => return Err(ContextError::Canceled.into()),
            }
        }
    }
}

/// Shared output cell a job writes its result into
#[derive(Debug)]
pub struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot(Arc::clone(&self.0))
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slot<T> {
    /// An empty slot
    pub fn new() -> Self {
        Slot(Arc::new(Mutex::new(None)))
    }

    /// Stores a value, replacing any previous one
    pub fn set(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    /// Takes the stored value, leaving the slot empty
    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }

    /// Whether a value is stored
    pub fn is_filled(&self) -> bool {
        self.0.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Eq, Error)]
    #[error("{0}")]
    struct TestError(&'static str);

    fn sleeping_job(delay: Duration, slot: Slot<u32>, value: u32) -> Job<TestError> {
        job(async move {
            tokio::time::sleep(delay).await;
            slot.set(value);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_all_jobs_succeed_and_fill_slots() {
        let slots: Vec<Slot<u32>> = (0..3).map(|_| Slot::new()).collect();
        let jobs = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| sleeping_job(Duration::from_millis(10), slot.clone(), i as u32))
            .collect();

        let result = run_parallel(&JobContext::background(), jobs).await;

        assert!(result.is_ok());
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(slot.take(), Some(i as u32));
        }
    }

    #[tokio::test]
    async fn test_first_failure_returns_without_waiting() {
        let jobs = vec![
            sleeping_job(Duration::from_secs(5), Slot::new(), 1),
            job(async { Err(TestError("job two broke")) }),
            sleeping_job(Duration::from_secs(5), Slot::new(), 3),
        ];

        let started = Instant::now();
        let result = run_parallel(&JobContext::background(), jobs).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        match result {
            Err(ParallelError::Job { index, source }) => {
                assert_eq!(index, 1);
                assert_eq!(source, TestError("job two broke"));
            }
            other => panic!("expected job error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_returns_context_error() {
        let ctx = JobContext::with_timeout(Duration::from_millis(10));
        let jobs = vec![
            sleeping_job(Duration::from_secs(1), Slot::new(), 1),
            sleeping_job(Duration::from_secs(1), Slot::new(), 2),
        ];

        let started = Instant::now();
        let result = run_parallel(&ctx, jobs).await;

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(
            result,
            Err(ParallelError::Context(ContextError::DeadlineExceeded))
        ));
    }

    #[tokio::test]
    async fn test_cancel_returns_canceled() {
        let ctx = JobContext::background();
        let canceler = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceler.cancel();
        });

        let jobs = vec![sleeping_job(Duration::from_secs(1), Slot::new(), 1)];
        let result = run_parallel(&ctx, jobs).await;

        assert!(matches!(result, Err(ParallelError::Context(ContextError::Canceled))));
    }

    #[tokio::test]
    async fn test_done_context_starts_nothing() {
        let ctx = JobContext::background();
        ctx.cancel();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        let result = run_parallel(
            &ctx,
            vec![job(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })],
        )
        .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ParallelError::Context(ContextError::Canceled))));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_job_list_succeeds() {
        let result = run_parallel::<TestError>(&JobContext::background(), Vec::new()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported() {
        let jobs: Vec<Job<TestError>> = vec![
            sleeping_job(Duration::from_secs(5), Slot::new(), 1),
            job(async {
                let explode = true;
                if explode {
                    panic!("boom");
                }
                Ok(())
            }),
        ];

        let result = run_parallel(&JobContext::background(), jobs).await;

        assert!(matches!(result, Err(ParallelError::Panicked { index: 1 })));
    }

    #[tokio::test]
    async fn test_abandoned_jobs_keep_running() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let jobs = vec![
            job(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            job(async { Err(TestError("fast failure")) }),
        ];

        assert!(run_parallel(&JobContext::background(), jobs).await.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1, "Detached job should finish");
    }

    #[tokio::test]
    async fn test_jobs_can_observe_cancellation() {
        let ctx = JobContext::with_timeout(Duration::from_millis(10));
        let token = ctx.token().clone();
        let stopped = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stopped);

        let jobs = vec![job(async move {
            tokio::select! {
                _ = token.cancelled() => { counter.fetch_add(1, Ordering::SeqCst); }
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
            Ok::<_, TestError>(())
        })];

        let result = run_parallel(&ctx, jobs).await;
        assert!(result.is_err());

        // A deadline does not cancel the token; the caller does that explicitly
        ctx.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_child_context_inherits_cancellation_and_tighter_deadline() {
        let parent = JobContext::with_timeout(Duration::from_secs(60));
        let child = parent.child(Some(Duration::from_secs(1)));

        assert!(child.deadline().unwrap() < parent.deadline().unwrap());
        assert!(child.err().is_none());

        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_slot_set_and_take() {
        let slot = Slot::new();
        assert!(!slot.is_filled());

        slot.clone().set("value");

        assert!(slot.is_filled());
        assert_eq!(slot.take(), Some("value"));
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_unrepresentable_timeout_has_no_deadline() {
        let ctx = JobContext::with_timeout(Duration::MAX);
        assert_eq!(ctx.deadline(), None);
        assert_eq!(ctx.err(), None);

        let child = JobContext::background().child(Some(Duration::MAX));
        assert_eq!(child.deadline(), None);
    }

    #[test]
    fn test_child_keeps_parent_deadline_when_own_overflows() {
        let parent = JobContext::with_timeout(Duration::from_secs(60));

        let child = parent.child(Some(Duration::MAX));

        assert_eq!(child.deadline(), parent.deadline());
    }
}
