//! Request batching with a size/time dispatch policy
//!
//! This module collects request envelopes into batches. A batch is dispatched
//! as soon as it holds `max_batch_size` envelopes, or once `batch_timeout`
//! has elapsed since its oldest member arrived, whichever comes first. Uses a
//! lock-free queue for minimal overhead. Only one worker collects at a time,
//! so batches are formed from the oldest envelopes in arrival order and each
//! envelope lands in exactly one batch.

use crate::envelope::{RequestEnvelope, ResponseMode};
use crate::response::ResponseHandle;
use batchloop_common::config::BatchingConfig;
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::METRICS;
use crossbeam::queue::SegQueue;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace};

/// Batched envelopes ready for processing
#[derive(Debug)]
pub struct Batch {
    /// Envelopes in arrival order
    pub envelopes: Vec<RequestEnvelope>,
}

impl Batch {
    /// Create a new empty batch
    pub fn new() -> Self {
        Self {
            envelopes: Vec::new(),
        }
    }

    /// Add an envelope to the batch
    pub fn add(&mut self, envelope: RequestEnvelope) {
        self.envelopes.push(envelope);
    }

    /// Get the batch size
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Deliver the same failure to every member
    pub fn fail_all(self, make_error: impl Fn() -> BatchLoopError) {
        for envelope in self.envelopes {
            envelope.fail(make_error());
        }
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Batch scheduler with a size/time dispatch trigger
///
/// Shared by reference between the HTTP handlers (producers) and the
/// prediction workers (consumers).
pub struct BatchScheduler {
    /// Configuration
    config: BatchingConfig,

    /// Intake queue (lock-free)
    queue: SegQueue<RequestEnvelope>,

    /// Current queue depth
    queue_depth: AtomicUsize,

    /// Shutdown flag
    shutdown: AtomicBool,

    /// Notification for new envelopes and shutdown
    notify: Notify,

    /// Held by the worker currently collecting a batch
    collector: Mutex<()>,
}

impl BatchScheduler {
    /// Create a new batch scheduler
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            queue: SegQueue::new(),
            queue_depth: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
            collector: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BatchingConfig {
        &self.config
    }

    /// Submit an input to the scheduler
    ///
    /// Returns the handle the caller reads its output from. Fails only when a
    /// bounded queue is full. After shutdown the handle is returned already
    /// carrying a failure marker.
    pub fn submit(&self, input: Value, mode: ResponseMode) -> Result<ResponseHandle> {
        let (envelope, handle) = RequestEnvelope::new(input, mode);

        if self.is_shutdown() {
            envelope.fail(BatchLoopError::shutdown("server is not accepting requests"));
            return Ok(handle);
        }

        // Depth is reserved before the push so a concurrent pop never underflows it
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max_queue_size) = self.config.max_queue_size {
            if depth > max_queue_size {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                return Err(BatchLoopError::queue_full(
                    "Request queue is full, rejecting new request",
                ));
            }
        }

        self.queue.push(envelope);
        METRICS.scheduler.queue_depth.set(depth as i64);
        self.notify.notify_one();

        trace!(request_id = %handle.id(), "Request submitted, queue depth: {}", depth);

        // Shutdown may have drained the queue between the check and the push
        if self.is_shutdown() {
            self.drain();
        }

        Ok(handle)
    }

    fn pop(&self) -> Option<RequestEnvelope> {
        loop {
            let envelope = self.queue.pop()?;
            let depth = self.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;
            METRICS.scheduler.queue_depth.set(depth as i64);

            if envelope.is_abandoned() {
                trace!(request_id = %envelope.id, "Skipping abandoned request");
                continue;
            }

            METRICS
                .scheduler
                .queue_time
                .observe(envelope.arrival_time.elapsed().as_secs_f64());
            return Some(envelope);
        }
    }

    /// Wait for the oldest queued envelope
    async fn first_envelope(&self) -> Option<RequestEnvelope> {
        loop {
            if self.is_shutdown() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.pop() {
                return Some(envelope);
            }

            if self.is_shutdown() {
                return None;
            }

            notified.await;
        }
    }

    /// Get the next batch of envelopes
    ///
    /// Waits for at least one envelope, then keeps collecting until the batch
    /// is full or `batch_timeout` has passed since the first member arrived.
    /// With `max_batch_size == 1` the batch is dispatched immediately.
    /// Returns `None` once the scheduler is shut down.
    ///
    /// Concurrent callers queue up behind the one currently collecting.
    pub async fn next_batch(&self) -> Option<Batch> {
        let _collecting = self.collector.lock().await;

        let first = self.first_envelope().await?;
        let deadline =
            tokio::time::Instant::from_std(first.arrival_time) + self.config.batch_timeout();

        let mut batch = Batch::new();
        batch.add(first);

        while batch.len() < self.config.max_batch_size {
            if let Some(envelope) = self.pop() {
                batch.add(envelope);
                continue;
            }

            if tokio::time::Instant::now() >= deadline || self.is_shutdown() {
                break;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.pop() {
                batch.add(envelope);
                continue;
            }

            if self.is_shutdown() {
                break;
            }

            let _ = tokio::time::timeout_at(deadline, notified).await;
        }

        if self.is_shutdown() {
            batch.fail_all(|| BatchLoopError::shutdown("server stopped before dispatch"));
            return None;
        }

        debug!(
            "Created batch: {} requests, oldest waited {:?}",
            batch.len(),
            batch.envelopes[0].arrival_time.elapsed()
        );
        METRICS.scheduler.batch_size.observe(batch.len() as f64);

        Some(batch)
    }

    /// Get the current queue depth
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// Check if the queue is healthy (not saturated)
    pub fn is_healthy(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        match self.config.max_queue_size {
            // 90% threshold
            Some(max_queue_size) => self.queue_depth() < (max_queue_size * 9 / 10).max(1),
            None => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn drain(&self) -> usize {
        let mut drained = 0;
        while let Some(envelope) = self.queue.pop() {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            envelope.fail(BatchLoopError::shutdown("server stopped before dispatch"));
            drained += 1;
        }
        METRICS.scheduler.queue_depth.set(self.queue_depth() as i64);
        drained
    }

    /// Shutdown the scheduler
    ///
    /// Wakes every waiting worker and fails all queued envelopes.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();

        let drained = self.drain();
        info!("Batch scheduler shut down, failed {} queued requests", drained);
    }
}
