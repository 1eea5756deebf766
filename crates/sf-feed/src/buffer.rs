//! Per-kind write buffer.
//!
//! The queue lock is held only to append or swap the batch out. The database
//! round trip runs under a second, per-buffer flush lock, so threshold and
//! timer flushes of one buffer never overlap while appends keep landing in the
//! fresh queue.

use crate::config::BufferSettings;
use crate::error::Result;
use crate::pending::{EventKind, PendingBatch};
use crate::SERVICE_NAME;
use async_trait::async_trait;
use sf_core::metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Outcome of one successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub kind: EventKind,
    /// Events handed to the flush.
    pub events: usize,
    /// Junction rows inserted or deleted, or reply increments applied.
    pub applied: u64,
    /// Posts whose counters were rewritten.
    pub posts_touched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Threshold,
    Timer,
    Manual,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Threshold => metrics::FLUSH_TRIGGER_THRESHOLD,
            FlushTrigger::Timer => metrics::FLUSH_TRIGGER_TIMER,
            FlushTrigger::Manual => metrics::FLUSH_TRIGGER_MANUAL,
        }
    }
}

/// Durable destination of a batch. Implementations must be all-or-nothing.
#[async_trait]
pub trait FlushSink<B: PendingBatch>: Send + Sync {
    async fn flush(&self, batch: B) -> Result<FlushReport>;
}

pub struct BatchBuffer<B: PendingBatch> {
    settings: BufferSettings,
    queue: Mutex<B>,
    flush_lock: Mutex<()>,
    sink: Arc<dyn FlushSink<B>>,
    /// `service` label on the buffer and flush series.
    metrics_service: &'static str,
}

impl<B: PendingBatch> BatchBuffer<B> {
    pub fn new(settings: BufferSettings, sink: Arc<dyn FlushSink<B>>) -> Self {
        Self {
            settings,
            queue: Mutex::new(B::default()),
            flush_lock: Mutex::new(()),
            sink,
            metrics_service: SERVICE_NAME,
        }
    }

    pub fn with_metrics_service(mut self, service_name: &'static str) -> Self {
        self.metrics_service = service_name;
        self
    }

    pub fn kind(&self) -> EventKind {
        B::KIND
    }

    pub fn settings(&self) -> BufferSettings {
        self.settings
    }

    /// Queues `event`. When the queue reaches `max_records` the batch is
    /// flushed on the caller's task and a flush failure is returned here; the
    /// failed batch is dropped, not re-queued.
    pub async fn append(&self, event: B::Event) -> Result<()> {
        let ready = {
            let mut queue = self.queue.lock().await;
            queue.push(event);
            if queue.len() >= self.settings.max_records {
                metrics::set_buffer_pending(self.metrics_service, B::KIND.as_str(), 0);
                Some(std::mem::take(&mut *queue))
            } else {
                metrics::set_buffer_pending(self.metrics_service, B::KIND.as_str(), queue.len());
                None
            }
        };

        match ready {
            Some(batch) => self
                .flush_batch(batch, FlushTrigger::Threshold)
                .await
                .map(|_| ()),
            None => Ok(()),
        }
    }

    /// Flushes whatever is queued right now. `None` when the queue was empty.
    pub async fn flush_now(&self) -> Result<Option<FlushReport>> {
        match self.take_pending().await {
            Some(batch) => self.flush_batch(batch, FlushTrigger::Manual).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Runs `f` against the queued events under the queue lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        let queue = self.queue.lock().await;
        f(&queue)
    }

    /// Whether a queued event matches `matches`. A batch already handed to
    /// the sink is not visible here.
    pub async fn contains(&self, matches: impl Fn(&B::Event) -> bool) -> bool {
        self.queue.lock().await.contains(&matches)
    }

    /// Removes queued events matching `remove` before they reach storage.
    pub async fn discard(&self, remove: impl Fn(&B::Event) -> bool) -> usize {
        let mut queue = self.queue.lock().await;
        let dropped = queue.discard(&remove);
        if dropped > 0 {
            metrics::set_buffer_pending(self.metrics_service, B::KIND.as_str(), queue.len());
        }
        dropped
    }

    /// Starts the periodic flush task. It stops when `shutdown` is cancelled;
    /// events still queued at that point are abandoned.
    pub fn spawn_flush_timer(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.settings.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let abandoned = buffer.len().await;
                        if abandoned > 0 {
                            tracing::warn!(
                                kind = %B::KIND,
                                abandoned,
                                "flush timer stopped with pending events"
                            );
                        } else {
                            tracing::debug!(kind = %B::KIND, "flush timer stopped");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Some(batch) = buffer.take_pending().await {
                            // Failures are logged and counted in flush_batch.
                            let _ = buffer.flush_batch(batch, FlushTrigger::Timer).await;
                        }
                    }
                }
            }
        })
    }

    async fn take_pending(&self) -> Option<B> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return None;
        }
        metrics::set_buffer_pending(self.metrics_service, B::KIND.as_str(), 0);
        Some(std::mem::take(&mut *queue))
    }

    async fn flush_batch(&self, batch: B, trigger: FlushTrigger) -> Result<FlushReport> {
        let _flushing = self.flush_lock.lock().await;
        let events = batch.len();
        let started = Instant::now();
        let result = self.sink.flush(batch).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(report) => {
                metrics::record_flush(
                    self.metrics_service,
                    B::KIND.as_str(),
                    trigger.as_str(),
                    metrics::FLUSH_RESULT_SUCCESS,
                    events,
                    elapsed,
                );
                tracing::debug!(
                    kind = %B::KIND,
                    trigger = trigger.as_str(),
                    events,
                    applied = report.applied,
                    posts_touched = report.posts_touched,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "buffer flushed"
                );
            }
            Err(err) => {
                metrics::record_flush(
                    self.metrics_service,
                    B::KIND.as_str(),
                    trigger.as_str(),
                    metrics::FLUSH_RESULT_ERROR,
                    events,
                    elapsed,
                );
                metrics::inc_dropped_events(self.metrics_service, B::KIND.as_str(), events);
                tracing::warn!(
                    kind = %B::KIND,
                    trigger = trigger.as_str(),
                    events,
                    error = %err,
                    "buffer flush failed; batch dropped"
                );
            }
        }

        result
    }
}
