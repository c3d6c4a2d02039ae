//! Request envelopes
//!
//! An envelope carries one inbound call from submission to its terminal
//! marker. The output sink is a tagged variant: non-streaming requests get a
//! oneshot channel, streaming requests an ordered unbounded channel. Every
//! terminal operation consumes the envelope, so at most one terminal marker
//! can ever be sent. An envelope dropped without one closes its channel,
//! which the receiving side reports as a shutdown failure.

use crate::response::ResponseHandle;
use batchloop_common::error::{BatchLoopError, Result};
use serde_json::Value;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

/// Request identifier
pub type RequestId = Uuid;

/// How a request wants its output delivered, fixed at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Exactly one final chunk
    NonStreaming,

    /// Zero or more chunks followed by an end marker
    Streaming,
}

/// Item delivered on a streaming sink
#[derive(Debug)]
pub enum StreamEvent {
    /// Intermediate output
    Chunk(Value),

    /// Final marker
    End,

    /// Failure marker
    Failed(BatchLoopError),
}

/// Producer half of an envelope's output channel
#[derive(Debug)]
pub(crate) enum OutputSink {
    NonStreaming {
        tx: oneshot::Sender<Result<Value>>,
        /// Chunks produced by a streaming routine for a non-streaming caller
        buffered: Vec<Value>,
    },
    Streaming(mpsc::UnboundedSender<StreamEvent>),
}

/// One in-flight request as tracked by the scheduler
#[derive(Debug)]
pub struct RequestEnvelope {
    /// Unique request identifier
    pub id: RequestId,

    /// Input payload
    input: Value,

    /// Request arrival time
    pub arrival_time: Instant,

    sink: OutputSink,
}

impl RequestEnvelope {
    /// Create an envelope and the handle its connection reads from
    pub fn new(input: Value, mode: ResponseMode) -> (Self, ResponseHandle) {
        let id = Uuid::new_v4();

        let (sink, handle) = match mode {
            ResponseMode::NonStreaming => {
                let (tx, rx) = oneshot::channel();
                (
                    OutputSink::NonStreaming {
                        tx,
                        buffered: Vec::new(),
                    },
                    ResponseHandle::non_streaming(id, rx),
                )
            }
            ResponseMode::Streaming => {
                let (tx, rx) = mpsc::unbounded_channel();
                (OutputSink::Streaming(tx), ResponseHandle::streaming(id, rx))
            }
        };

        let envelope = Self {
            id,
            input,
            arrival_time: Instant::now(),
            sink,
        };

        (envelope, handle)
    }

    pub fn mode(&self) -> ResponseMode {
        match self.sink {
            OutputSink::NonStreaming { .. } => ResponseMode::NonStreaming,
            OutputSink::Streaming(_) => ResponseMode::Streaming,
        }
    }

    /// Borrow the input payload
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Move the input payload out, leaving `null` behind
    pub fn take_input(&mut self) -> Value {
        std::mem::take(&mut self.input)
    }

    /// Whether the connection stopped listening
    pub fn is_abandoned(&self) -> bool {
        match &self.sink {
            OutputSink::NonStreaming { tx, .. } => tx.is_closed(),
            OutputSink::Streaming(tx) => tx.is_closed(),
        }
    }

    /// Push an intermediate chunk. Returns `false` once the connection is gone.
    pub fn emit(&mut self, chunk: Value) -> bool {
        match &mut self.sink {
            OutputSink::NonStreaming { tx, buffered } => {
                buffered.push(chunk);
                !tx.is_closed()
            }
            OutputSink::Streaming(tx) => {
                trace!(request_id = %self.id, "Emitting chunk");
                tx.send(StreamEvent::Chunk(chunk)).is_ok()
            }
        }
    }

    /// Deliver a single complete output as the final chunk
    pub fn respond(self, output: Value) {
        match self.sink {
            OutputSink::NonStreaming { tx, .. } => {
                let _ = tx.send(Ok(output));
            }
            OutputSink::Streaming(tx) => {
                if tx.send(StreamEvent::Chunk(output)).is_ok() {
                    let _ = tx.send(StreamEvent::End);
                }
            }
        }
    }

    /// Signal the end of a streamed output.
    ///
    /// Non-streaming callers receive the buffered chunks as a JSON array.
    pub fn finish(self) {
        match self.sink {
            OutputSink::NonStreaming { tx, buffered } => {
                let _ = tx.send(Ok(Value::Array(buffered)));
            }
            OutputSink::Streaming(tx) => {
                let _ = tx.send(StreamEvent::End);
            }
        }
    }

    /// Deliver a failure marker
    pub fn fail(self, error: BatchLoopError) {
        trace!(request_id = %self.id, "Failing request: {}", error);
        match self.sink {
            OutputSink::NonStreaming { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            OutputSink::Streaming(tx) => {
                let _ = tx.send(StreamEvent::Failed(error));
            }
        }
    }
}
