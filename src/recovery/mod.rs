//! Batch error recovery
//!
//! Re-attempts failed work items with bounded concurrency and exponential backoff.
//! Items are pulled from an explicit work queue by a fixed pool of workers; a failed
//! retry is pushed back onto the queue instead of recursing, so the number of retries
//! never grows the call stack.

pub mod backoff;

pub use backoff::BackoffPolicy;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RecoveryConfig;
use crate::error::{ApiError, ErrorCategory, StageError};

/// A failed unit of work awaiting recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchErrorItem {
    pub item_id: String,
    /// Most recent failure.
    pub error: StageError,
    pub retryable: bool,
    pub retry_count: u32,
    pub last_attempt: DateTime<Utc>,
}

impl BatchErrorItem {
    pub fn new(item_id: impl Into<String>, error: StageError) -> Self {
        Self {
            item_id: item_id.into(),
            retryable: error.is_retryable(),
            error,
            retry_count: 0,
            last_attempt: Utc::now(),
        }
    }

    pub fn last_error(&self) -> &str {
        &self.error.message
    }

    /// Whether another attempt is allowed under `max_retries`.
    pub fn is_eligible(&self, max_retries: u32) -> bool {
        self.retryable && self.retry_count < max_retries
    }

    fn record_failure(&mut self, error: StageError) {
        self.retry_count += 1;
        self.retryable = error.is_retryable();
        self.error = error;
        self.last_attempt = Utc::now();
    }
}

/// Options for one [`RecoveryQueue::recover`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOptions {
    pub max_retries: u32,
    pub concurrency: usize,
    /// Base delay for the first retry. When unset the error category's default is used.
    pub initial_delay: Option<Duration>,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            concurrency: 3,
            initial_delay: None,
            max_delay: Duration::from_millis(30_000),
            jitter_ratio: 0.3,
        }
    }
}

impl From<&RecoveryConfig> for RecoveryOptions {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            concurrency: config.concurrency,
            initial_delay: config.initial_delay_ms.map(Duration::from_millis),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio,
        }
    }
}

impl RecoveryOptions {
    pub fn policy_for(&self, category: ErrorCategory) -> BackoffPolicy {
        let initial = self
            .initial_delay
            .or_else(|| category.default_backoff())
            .unwrap_or(Duration::from_millis(1_000));
        BackoffPolicy::new(initial, self.max_delay).with_jitter_ratio(self.jitter_ratio)
    }
}

/// An item that succeeded on retry, with the value it produced.
#[derive(Debug, Clone)]
pub struct RecoveredItem<T> {
    pub item: BatchErrorItem,
    pub value: T,
}

/// Outcome of a recovery run.
#[derive(Debug, Clone)]
pub struct RecoveryState<T> {
    pub recovered: Vec<RecoveredItem<T>>,
    /// Items that were fatal, ran out of retries, or could not be retried at all.
    pub failed: Vec<BatchErrorItem>,
}

impl<T> RecoveryState<T> {
    pub fn is_fully_recovered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cumulative counters across every run on one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub runs: usize,
    pub attempts: usize,
    pub recovered: usize,
    pub failed: usize,
}

/// Bounded-concurrency retry queue.
///
/// A queue runs one batch at a time; a second concurrent `recover` call is rejected with
/// [`ApiError::RecoveryInProgress`].
#[derive(Debug, Default)]
pub struct RecoveryQueue {
    active: AtomicBool,
    stats: RwLock<RecoveryStats>,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ApiError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ApiError::RecoveryInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Shared state borrowed by every worker of one run.
struct RunContext<'a, T, F> {
    receiver: tokio::sync::Mutex<UnboundedReceiver<BatchErrorItem>>,
    sender: UnboundedSender<BatchErrorItem>,
    outstanding: AtomicUsize,
    done: CancellationToken,
    cancel: &'a CancellationToken,
    process: &'a F,
    options: &'a RecoveryOptions,
    recovered: Mutex<Vec<RecoveredItem<T>>>,
    failed: Mutex<Vec<BatchErrorItem>>,
    attempts: AtomicUsize,
}

impl<T, F> RunContext<'_, T, F> {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.cancel();
        }
    }
}

impl RecoveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RecoveryStats {
        self.stats.read().clone()
    }

    /// Retries every eligible item with `process` until it succeeds, becomes fatal, or
    /// exhausts `options.max_retries`.
    pub async fn recover<T, F, Fut>(
        &self,
        failed_items: Vec<BatchErrorItem>,
        process: F,
        options: &RecoveryOptions,
    ) -> Result<RecoveryState<T>, ApiError>
    where
        F: Fn(BatchErrorItem) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        self.recover_until(failed_items, process, options, &CancellationToken::new())
            .await
    }

    /// Like [`RecoveryQueue::recover`], but stops once `cancel` fires: pending backoff
    /// waits are cut short and no further attempts start. Attempts already in flight run
    /// to completion. Items that were not retried end up in `failed`.
    pub async fn recover_until<T, F, Fut>(
        &self,
        failed_items: Vec<BatchErrorItem>,
        process: F,
        options: &RecoveryOptions,
        cancel: &CancellationToken,
    ) -> Result<RecoveryState<T>, ApiError>
    where
        F: Fn(BatchErrorItem) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let _guard = ActiveGuard::acquire(&self.active)?;

        let (pending, frozen): (Vec<_>, Vec<_>) = failed_items
            .into_iter()
            .partition(|item| item.is_eligible(options.max_retries));
        for item in &frozen {
            debug!(
                item_id = %item.item_id,
                retryable = item.retryable,
                retry_count = item.retry_count,
                "Skipping recovery for ineligible item"
            );
        }

        let (sender, receiver) = unbounded_channel();
        let pending_count = pending.len();
        for item in pending {
            // The receiver is alive for the whole run.
            let _ = sender.send(item);
        }

        let ctx = RunContext {
            receiver: tokio::sync::Mutex::new(receiver),
            sender,
            outstanding: AtomicUsize::new(pending_count),
            done: CancellationToken::new(),
            cancel,
            process: &process,
            options,
            recovered: Mutex::new(Vec::new()),
            failed: Mutex::new(frozen),
            attempts: AtomicUsize::new(0),
        };
        if pending_count == 0 {
            ctx.done.cancel();
        }

        let worker_count = options.concurrency.max(1).min(pending_count.max(1));
        info!(
            items = pending_count,
            workers = worker_count,
            max_retries = options.max_retries,
            "Starting recovery run"
        );
        join_all((0..worker_count).map(|worker_id| Self::worker_loop(worker_id, &ctx))).await;

        if cancel.is_cancelled() {
            let mut receiver = ctx.receiver.lock().await;
            let mut failed = ctx.failed.lock();
            while let Ok(item) = receiver.try_recv() {
                failed.push(item);
            }
            warn!(
                unfinished = failed.len(),
                "Recovery run cancelled before every item was retried"
            );
        }

        let state = RecoveryState {
            recovered: std::mem::take(&mut *ctx.recovered.lock()),
            failed: std::mem::take(&mut *ctx.failed.lock()),
        };
        {
            let mut stats = self.stats.write();
            stats.runs += 1;
            stats.attempts += ctx.attempts.load(Ordering::Relaxed);
            stats.recovered += state.recovered.len();
            stats.failed += state.failed.len();
        }
        info!(
            recovered = state.recovered.len(),
            failed = state.failed.len(),
            "Recovery run finished"
        );
        Ok(state)
    }

    async fn worker_loop<T, F, Fut>(worker_id: usize, ctx: &RunContext<'_, T, F>)
    where
        F: Fn(BatchErrorItem) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        debug!(worker_id, "Recovery worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.done.cancelled() => None,
                _ = ctx.cancel.cancelled() => None,
                item = async { ctx.receiver.lock().await.recv().await } => item,
            };
            let Some(mut item) = next else {
                break;
            };

            let policy = ctx.options.policy_for(item.error.category);
            let delay = policy.delay_for(item.retry_count, &item.error);
            debug!(
                worker_id,
                item_id = %item.item_id,
                retry_count = item.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Waiting before retry"
            );
            let interrupted = tokio::select! {
                _ = ctx.cancel.cancelled() => true,
                _ = sleep(delay) => false,
            };
            if interrupted {
                debug!(worker_id, item_id = %item.item_id, "Retry cancelled during backoff");
                ctx.failed.lock().push(item);
                ctx.finish_one();
                break;
            }

            item.last_attempt = Utc::now();
            ctx.attempts.fetch_add(1, Ordering::Relaxed);
            match (ctx.process)(item.clone()).await {
                Ok(value) => {
                    info!(
                        worker_id,
                        item_id = %item.item_id,
                        retry_count = item.retry_count,
                        "Item recovered"
                    );
                    ctx.recovered.lock().push(RecoveredItem { item, value });
                    ctx.finish_one();
                }
                Err(err) => {
                    item.record_failure(err);
                    if item.is_eligible(ctx.options.max_retries) {
                        warn!(
                            worker_id,
                            item_id = %item.item_id,
                            retry_count = item.retry_count,
                            error = %item.error,
                            "Retry failed, re-enqueueing"
                        );
                        if let Err(returned) = ctx.sender.send(item) {
                            ctx.failed.lock().push(returned.0);
                            ctx.finish_one();
                        }
                    } else {
                        error!(
                            worker_id,
                            item_id = %item.item_id,
                            retry_count = item.retry_count,
                            retryable = item.retryable,
                            error = %item.error,
                            "Item failed permanently"
                        );
                        ctx.failed.lock().push(item);
                        ctx.finish_one();
                    }
                }
            }
        }
        debug!(worker_id, "Recovery worker stopped");
    }
}

/// Options for [`with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            jitter_ratio: 0.3,
        }
    }
}

/// Runs a single operation with the recovery backoff schedule.
pub async fn with_retry<T, F, Fut>(mut operation: F, options: &RetryOptions) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let policy = BackoffPolicy::new(options.initial_delay, options.max_delay)
        .with_jitter_ratio(options.jitter_ratio);
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= options.max_attempts.max(1) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1, &err);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
