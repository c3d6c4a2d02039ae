//! Prediction worker loop and worker pool
//!
//! Each worker owns one predictor replica and runs on its own OS thread, so a
//! slow (synchronous) predict routine only throttles that worker. A worker
//! processes one batch at a time. Failures raised by the routine, including
//! panics, abort the current batch only and are delivered to every member
//! that has not completed yet.

use crate::batching::{Batch, BatchScheduler};
use crate::envelope::RequestEnvelope;
use crate::predictor::{Backend, PredictResult, PredictorFactory, StreamingPredictor};
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::{LatencyTimer, METRICS};
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "predict routine panicked".to_string()
    }
}

/// Runs batches through one predictor replica
pub struct PredictionWorker {
    id: usize,
    backend: Backend,
    /// Call `predict_batch` instead of per-item `predict`
    batched: bool,
}

impl PredictionWorker {
    /// Create a new worker around an already set-up backend
    pub fn new(id: usize, backend: Backend, batched: bool) -> Self {
        Self {
            id,
            backend,
            batched,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process one batch, delivering exactly one terminal marker per member
    pub fn process_batch(&mut self, batch: Batch) {
        let start = Instant::now();
        let size = batch.len();

        let mut envelopes = batch.envelopes;
        let inputs: Vec<Value> = envelopes.iter_mut().map(RequestEnvelope::take_input).collect();

        let batched = self.batched;
        let outcome = METRICS.scheduler.predict_duration.time(|| match &mut self.backend {
            Backend::Blocking(predictor) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    if batched {
                        predictor.predict_batch(inputs)
                    } else {
                        inputs
                            .into_iter()
                            .map(|input| predictor.predict(input))
                            .collect()
                    }
                }));
                deliver_outputs(&mut envelopes, result)
            }
            Backend::Streaming(predictor) => {
                pump_stream(predictor.as_mut(), &mut envelopes, inputs)
            }
        });

        match outcome {
            Ok(()) => {
                let duration = start.elapsed();
                debug!(
                    worker = self.id,
                    "Processed batch of {} requests in {:?} ({:.2} ms/request)",
                    size,
                    duration,
                    duration.as_secs_f64() * 1000.0 / size.max(1) as f64
                );
            }
            Err(message) => {
                error!(worker = self.id, "Error processing batch of {}: {}", size, message);
                METRICS.scheduler.failed_batches.inc();
                for envelope in envelopes {
                    envelope.fail(BatchLoopError::prediction(message.clone()));
                }
            }
        }
    }

    /// Main worker processing loop; returns once the scheduler shuts down
    pub fn run(mut self, scheduler: Arc<BatchScheduler>, runtime: Handle) {
        info!(worker = self.id, "Starting worker processing loop");

        while let Some(batch) = runtime.block_on(scheduler.next_batch()) {
            self.process_batch(batch);
        }

        info!(worker = self.id, "Worker processing loop stopped");
    }
}

/// Hand one output to each envelope. Envelopes are drained on success and
/// left in place for the caller to fail otherwise.
fn deliver_outputs(
    envelopes: &mut Vec<RequestEnvelope>,
    result: std::thread::Result<PredictResult<Vec<Value>>>,
) -> std::result::Result<(), String> {
    let outputs = match result {
        Ok(Ok(outputs)) => outputs,
        Ok(Err(e)) => return Err(format!("{:#}", e)),
        Err(payload) => return Err(panic_message(payload)),
    };

    if outputs.len() != envelopes.len() {
        return Err(format!(
            "predict routine returned {} outputs for {} inputs",
            outputs.len(),
            envelopes.len()
        ));
    }

    for (envelope, output) in envelopes.drain(..).zip(outputs) {
        envelope.respond(output);
    }
    Ok(())
}

/// Pump a streaming routine until every member has completed.
///
/// Members are finished as soon as their slot reports completion; members
/// whose connection went away are dropped. On failure the members still
/// open remain in `envelopes`.
fn pump_stream(
    predictor: &mut dyn StreamingPredictor,
    envelopes: &mut Vec<RequestEnvelope>,
    inputs: Vec<Value>,
) -> std::result::Result<(), String> {
    let size = envelopes.len();
    let mut open: Vec<Option<RequestEnvelope>> = envelopes.drain(..).map(Some).collect();

    let result = catch_unwind(AssertUnwindSafe(|| -> PredictResult<()> {
        let mut stream = predictor.predict_stream(inputs)?;

        while open.iter().any(Option::is_some) {
            let Some(step) = stream.next_step() else {
                break;
            };
            let step = step?;

            if step.len() != size {
                anyhow::bail!(
                    "streaming step produced {} slots for a batch of {}",
                    step.len(),
                    size
                );
            }

            for (slot, chunk) in open.iter_mut().zip(step) {
                match chunk {
                    Some(chunk) => {
                        let gone = match slot {
                            Some(envelope) => !envelope.emit(chunk),
                            None => false,
                        };
                        if gone {
                            if let Some(envelope) = slot.take() {
                                warn!(
                                    request_id = %envelope.id,
                                    "Client went away, dropping further chunks"
                                );
                            }
                        }
                    }
                    None => {
                        if let Some(envelope) = slot.take() {
                            envelope.finish();
                        }
                    }
                }
            }
        }
        Ok(())
    }));

    let outcome = match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload)),
    };

    let still_open = open.into_iter().flatten();
    match outcome {
        Ok(()) => {
            for envelope in still_open {
                envelope.finish();
            }
            Ok(())
        }
        Err(message) => {
            envelopes.extend(still_open);
            Err(message)
        }
    }
}

/// Pool of prediction workers pulling from one shared scheduler
pub struct WorkerPool {
    scheduler: Arc<BatchScheduler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    streaming: bool,
}

impl WorkerPool {
    /// Spawn `num_workers` workers and wait until every replica is set up
    ///
    /// Must be called from within a tokio runtime. Fails if any replica's
    /// setup fails, in which case the scheduler is shut down.
    pub async fn start(
        scheduler: Arc<BatchScheduler>,
        factory: PredictorFactory,
        num_workers: usize,
    ) -> Result<Self> {
        let runtime = Handle::current();
        let batched = scheduler.config().max_batch_size > 1;

        let mut threads = Vec::with_capacity(num_workers);
        let mut ready = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<bool, String>>();
            let factory = factory.clone();
            let scheduler = scheduler.clone();
            let runtime = runtime.clone();

            let thread = std::thread::Builder::new()
                .name(format!("batchloop-worker-{}", id))
                .spawn(move || {
                    let mut backend = factory(id);
                    let streaming = backend.is_streaming();

                    let setup = catch_unwind(AssertUnwindSafe(|| backend.setup()));
                    let setup = match setup {
                        Ok(Ok(())) => Ok(streaming),
                        Ok(Err(e)) => Err(format!("{:#}", e)),
                        Err(payload) => Err(panic_message(payload)),
                    };
                    let ok = setup.is_ok();
                    let _ = ready_tx.send(setup);

                    if ok {
                        PredictionWorker::new(id, backend, batched).run(scheduler, runtime);
                    }
                })?;

            threads.push(thread);
            ready.push(ready_rx);
        }

        let pool = Self {
            scheduler: scheduler.clone(),
            threads: Mutex::new(threads),
            streaming: false,
        };

        let mut streaming = None;
        for (id, ready_rx) in ready.into_iter().enumerate() {
            let result = ready_rx
                .await
                .unwrap_or_else(|_| Err("worker thread exited during setup".to_string()));

            match result {
                Ok(is_streaming) => {
                    if streaming.is_some_and(|s| s != is_streaming) {
                        pool.shutdown().await;
                        return Err(BatchLoopError::config(
                            "all workers must run the same kind of predictor",
                        ));
                    }
                    streaming = Some(is_streaming);
                }
                Err(message) => {
                    error!(worker = id, "Predictor setup failed: {}", message);
                    pool.shutdown().await;
                    return Err(BatchLoopError::internal(format!(
                        "predictor setup failed on worker {}: {}",
                        id, message
                    )));
                }
            }
        }

        info!("Worker pool started with {} workers (batched: {})", num_workers, batched);

        Ok(Self {
            streaming: streaming.unwrap_or(false),
            ..pool
        })
    }

    pub fn scheduler(&self) -> &Arc<BatchScheduler> {
        &self.scheduler
    }

    /// Whether the workers run a streaming routine
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Stop the scheduler and wait for every worker to finish its current batch
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();

        let threads: Vec<_> = std::mem::take(&mut *self.threads.lock());
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                if thread.join().is_err() {
                    warn!("Worker thread panicked during shutdown");
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!("Failed to join worker threads");
        }
        info!("Worker pool shut down");
    }
}
