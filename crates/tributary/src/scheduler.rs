//! Bounded concurrent task scheduler.
//!
//! [`WorkerScheduler`] runs submitted futures on tokio tasks with at most
//! `workers` in flight. When a tick interval is configured, every task also
//! waits for one tick of a GCRA limiter (burst 1) before it runs, which caps
//! throughput at one task per interval regardless of the worker count.
//!
//! Task failures and panics never escape the scheduler. They are collected and
//! returned from [`WorkerScheduler::wait`].
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use tributary::scheduler::WorkerScheduler;
//!
//! // 4 operations per 200ms: one tick every 50ms
//! let scheduler = WorkerScheduler::with_budget(8, 4, Duration::from_millis(200), shutdown)?;
//! for page in 1..=10 {
//!     scheduler.submit(async move { fetch(page).await })?;
//! }
//! scheduler.wait().await?;
//! ```

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{Notify, Semaphore};

use crate::context::Shutdown;
use crate::error::{HarvestError, Result};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Interval between ticks for a budget of `requests` per `duration`.
///
/// # Errors
/// Returns [`HarvestError::Config`] when `requests` is zero or the resulting
/// interval rounds down to zero.
pub fn calc_tick_interval(requests: u32, duration: Duration) -> Result<Duration> {
    if requests == 0 {
        return Err(HarvestError::config("request budget must be positive"));
    }
    let interval = duration / requests;
    if interval.is_zero() {
        return Err(HarvestError::config(format!(
            "tick interval for {requests} requests per {duration:?} rounds to zero"
        )));
    }
    Ok(interval)
}

fn build_limiter(interval: Duration) -> Option<Arc<GovernorRateLimiter>> {
    Quota::with_period(interval)
        .map(|quota| Arc::new(RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN))))
}

/// Fixed-size worker pool with optional tick pacing.
///
/// Cloning shares the same pool.
#[derive(Clone)]
pub struct WorkerScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    workers: usize,
    semaphore: Arc<Semaphore>,
    limiter: RwLock<Option<Arc<GovernorRateLimiter>>>,
    tick_interval: RwLock<Option<Duration>>,
    shutdown: Shutdown,
    pending: AtomicUsize,
    idle: Notify,
    errors: Mutex<Vec<HarvestError>>,
    failed: AtomicBool,
}

impl std::fmt::Debug for WorkerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScheduler")
            .field("workers", &self.inner.workers)
            .field("tick_interval", &self.tick_interval())
            .field("pending", &self.inner.pending.load(Ordering::SeqCst))
            .finish()
    }
}

impl WorkerScheduler {
    /// Create a scheduler with `workers` slots and an optional tick interval.
    ///
    /// A zero worker count is raised to one.
    pub fn new(workers: usize, tick_interval: Option<Duration>, shutdown: Shutdown) -> Self {
        let workers = workers.max(1);
        let tick_interval = tick_interval.filter(|i| !i.is_zero());
        Self {
            inner: Arc::new(SchedulerInner {
                workers,
                semaphore: Arc::new(Semaphore::new(workers)),
                limiter: RwLock::new(tick_interval.and_then(build_limiter)),
                tick_interval: RwLock::new(tick_interval),
                shutdown,
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                errors: Mutex::new(Vec::new()),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a scheduler paced at `max_ops` per `per`.
    pub fn with_budget(
        workers: usize,
        max_ops: u32,
        per: Duration,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let interval = calc_tick_interval(max_ops, per)?;
        Ok(Self::new(workers, Some(interval), shutdown))
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        *self
            .inner
            .tick_interval
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    /// Replace the tick interval. `None` disables pacing.
    ///
    /// Tasks already waiting for a tick finish waiting on the old limiter.
    pub fn reset(&self, tick_interval: Option<Duration>) {
        let tick_interval = tick_interval.filter(|i| !i.is_zero());
        *self
            .inner
            .limiter
            .write()
            .unwrap_or_else(|e| e.into_inner()) = tick_interval.and_then(build_limiter);
        *self
            .inner
            .tick_interval
            .write()
            .unwrap_or_else(|e| e.into_inner()) = tick_interval;
        tracing::debug!(interval = ?tick_interval, "Scheduler tick interval reset");
    }

    /// Submit a task that takes a worker slot and one tick.
    ///
    /// # Errors
    /// Returns [`HarvestError::Cancelled`] if shutdown was already requested
    /// or the scheduler has been released.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.shutdown.check()?;
        if self.inner.semaphore.is_closed() {
            return Err(HarvestError::Cancelled);
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.run_paced(task).await;
            inner.finish(result);
        });
        Ok(())
    }

    /// Schedule a continuation that is tracked by [`WorkerScheduler::wait`]
    /// but takes neither a worker slot nor a tick.
    pub fn next_tick<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.shutdown.check()?;

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = match inner.shutdown.check() {
                Ok(()) => run_isolated(task).await,
                Err(e) => Err(e),
            };
            inner.finish(result);
        });
        Ok(())
    }

    /// Whether any task has failed since the scheduler was created.
    pub fn has_error(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Wait for every submitted task and return the collected errors.
    ///
    /// Errors are drained: a second `wait` only reports new failures.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let errors = std::mem::take(&mut *self.inner.errors.lock().unwrap_or_else(|e| e.into_inner()));
        HarvestError::combine(errors)
    }

    /// Stop accepting work. Tasks still waiting for a slot are cancelled.
    pub fn release(&self) {
        self.inner.semaphore.close();
    }
}

impl SchedulerInner {
    async fn run_paced<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| HarvestError::Cancelled)?;

        let limiter = self
            .limiter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(limiter) = limiter {
            tokio::select! {
                _ = limiter.until_ready() => {}
                _ = self.shutdown.requested() => return Err(HarvestError::Cancelled),
            }
        }

        self.shutdown.check()?;
        run_isolated(task).await
    }

    fn finish(&self, result: Result<()>) {
        if let Err(e) = result {
            if !e.is_cancelled() {
                self.failed.store(true, Ordering::SeqCst);
                tracing::debug!(error = %e, "Scheduled task failed");
            }
            self.errors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(e);
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Run `task` on its own tokio task so a panic surfaces as an error.
async fn run_isolated<F>(task: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(task).await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HarvestError::Panicked { message })
        }
        Err(_) => Err(HarvestError::Cancelled),
    }
}
