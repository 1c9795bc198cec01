//! Admission control for calls against a per-minute provider quota.
//!
//! The scheduler holds `max_concurrent` capacity units. A caller that finds a
//! unit available runs immediately; otherwise it waits in a FIFO queue. A
//! background ticker adds one unit every refill interval, whether or not any
//! call finished: the tick hands the unit straight to the oldest waiter, or
//! returns it to the pool (capped at `max_concurrent`) when nobody waits.
//! Finishing a call never returns capacity early.
//!
//! Each admitted task runs under a `RetryPolicy`: a rate-limit failure is
//! retried after a fixed delay, anything else propagates at once.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::ProgressTracker;
use crate::config::SchedulerConfig;
use crate::error::ProviderError;

/// Decides whether a failure is the provider asking us to slow down.
pub type RateLimitClassifier = Arc<dyn Fn(&ProviderError) -> bool + Send + Sync>;

/// Fixed-delay retry for rate-limit failures.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    classifier: RateLimitClassifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Retry whatever the provider adapter typed as `RateLimited`.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self::with_classifier(max_attempts, delay, ProviderError::is_rate_limited)
    }

    pub fn with_classifier(
        max_attempts: u32,
        delay: Duration,
        classifier: impl Fn(&ProviderError) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            classifier: Arc::new(classifier),
        }
    }

    /// Run `task`, retrying rate-limit failures until attempts run out.
    pub async fn run<T, F, Fut>(&self, mut task: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match task().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && (self.classifier)(&e) => {
                    warn!(
                        "Rate limited (attempt {attempt}/{}), retrying in {:?}: {e}",
                        self.max_attempts, self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Point-in-time view of the scheduler's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub available: usize,
    pub active: usize,
    pub queued: usize,
}

struct SchedulerState {
    available: usize,
    active: usize,
    waiting: VecDeque<oneshot::Sender<ActiveGuard>>,
}

struct Shared {
    state: Mutex<SchedulerState>,
    max_concurrent: usize,
    progress: Option<ProgressTracker>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_queued(&self, state: &SchedulerState) {
        if let Some(progress) = &self.progress {
            progress.set_queued(state.waiting.len());
        }
    }

    /// One refill tick: wake the oldest live waiter, or bank the unit.
    fn refill(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.lock();
                match state.waiting.pop_front() {
                    Some(tx) => {
                        self.report_queued(&state);
                        tx
                    }
                    None => {
                        state.available = (state.available + 1).min(self.max_concurrent);
                        debug!("Refill: {} of {} units available", state.available, self.max_concurrent);
                        return;
                    }
                }
            };

            // Dropping a rejected guard releases its active count.
            if waiter.send(ActiveGuard::acquire(self.clone())).is_ok() {
                debug!("Refill: admitted queued caller");
                return;
            }
            debug!("Refill: skipped abandoned caller");
        }
    }
}

/// Counts one running task; released on drop whatever the task's outcome.
struct ActiveGuard {
    shared: Arc<Shared>,
}

impl ActiveGuard {
    fn acquire(shared: Arc<Shared>) -> Self {
        shared.lock().active += 1;
        Self { shared }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.active = state.active.saturating_sub(1);
    }
}

pub struct RateScheduler {
    shared: Arc<Shared>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl RateScheduler {
    /// Create a scheduler with a full pool and start its refill ticker.
    /// Must be called from within a tokio runtime.
    pub fn new(
        max_concurrent: usize,
        refill_interval: Duration,
        retry: RetryPolicy,
        progress: Option<ProgressTracker>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                available: max_concurrent,
                active: 0,
                waiting: VecDeque::new(),
            }),
            max_concurrent,
            progress,
        });
        let shutdown = CancellationToken::new();
        spawn_refill(shared.clone(), refill_interval, shutdown.clone());

        Self {
            shared,
            retry,
            shutdown,
        }
    }

    pub fn from_config(config: &SchedulerConfig, progress: ProgressTracker) -> Self {
        info!(
            "Rate scheduler: {} units, refill every {}s, {} attempts with {}s backoff",
            config.max_concurrent,
            config.refill_interval_secs,
            config.max_attempts,
            config.retry_delay_secs
        );
        Self::new(
            config.max_concurrent,
            config.refill_interval(),
            RetryPolicy::new(config.max_attempts, config.retry_delay()),
            Some(progress),
        )
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        SchedulerStats {
            available: state.available,
            active: state.active,
            queued: state.waiting.len(),
        }
    }

    /// Run `task` once capacity allows, retrying per the scheduler's policy.
    ///
    /// `task` is called again for each retry, so it must be able to rebuild
    /// its request.
    pub async fn schedule<T, F, Fut>(&self, task: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let _active = self.admit().await?;
        self.retry.run(task).await
    }

    async fn admit(&self) -> Result<ActiveGuard, ProviderError> {
        let admitted = {
            let mut state = self.shared.lock();
            if state.available > 0 {
                state.available -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                self.shared.report_queued(&state);
                debug!("No capacity, queued at position {}", state.waiting.len());
                Some(rx)
            }
        };

        match admitted {
            None => Ok(ActiveGuard::acquire(self.shared.clone())),
            Some(rx) => rx.await.map_err(|_| ProviderError::Transport {
                message: "rate scheduler stopped".into(),
            }),
        }
    }

    /// Forget queued callers whose futures were dropped, returning how many.
    pub fn prune_abandoned(&self) -> usize {
        let mut state = self.shared.lock();
        let before = state.waiting.len();
        state.waiting.retain(|tx| !tx.is_closed());
        let removed = before - state.waiting.len();
        if removed > 0 {
            self.shared.report_queued(&state);
            debug!("Pruned {removed} abandoned callers");
        }
        removed
    }

    /// Stop the refill ticker and fail any queued callers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RateScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_refill(shared: Arc<Shared>, interval: Duration, shutdown: CancellationToken) {
    let first_tick = Instant::now() + interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(first_tick, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => shared.refill(),
            }
        }
        let mut state = shared.lock();
        state.waiting.clear();
        shared.report_queued(&state);
        debug!("Refill ticker stopped");
    });
}
