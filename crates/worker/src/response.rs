//! Response multiplexing
//!
//! The consumer half of an envelope. A connection handler owns exactly one
//! `ResponseHandle` and drains it in production order. Dropping the handle is
//! how a disconnected client tells the worker to stop sending.

use crate::envelope::{RequestId, StreamEvent};
use batchloop_common::error::{BatchLoopError, Result};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Consumer side of an envelope's output channel
#[derive(Debug)]
pub enum ResponseHandle {
    NonStreaming {
        id: RequestId,
        rx: oneshot::Receiver<Result<Value>>,
    },
    Streaming {
        id: RequestId,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
    },
}

fn closed_early(id: RequestId) -> BatchLoopError {
    warn!(request_id = %id, "Response channel closed before a terminal marker");
    BatchLoopError::shutdown("request was dropped before completion")
}

impl ResponseHandle {
    pub(crate) fn non_streaming(id: RequestId, rx: oneshot::Receiver<Result<Value>>) -> Self {
        ResponseHandle::NonStreaming { id, rx }
    }

    pub(crate) fn streaming(id: RequestId, rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        ResponseHandle::Streaming { id, rx }
    }

    pub fn id(&self) -> RequestId {
        match self {
            ResponseHandle::NonStreaming { id, .. } => *id,
            ResponseHandle::Streaming { id, .. } => *id,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, ResponseHandle::Streaming { .. })
    }

    /// Wait for the complete response.
    ///
    /// A streaming handle is drained and its chunks returned as a JSON array.
    pub async fn collect(self) -> Result<Value> {
        match self {
            ResponseHandle::NonStreaming { id, rx } => match rx.await {
                Ok(result) => result,
                Err(_) => Err(closed_early(id)),
            },
            ResponseHandle::Streaming { id, mut rx } => {
                let mut chunks = Vec::new();
                loop {
                    match rx.recv().await {
                        Some(StreamEvent::Chunk(chunk)) => chunks.push(chunk),
                        Some(StreamEvent::End) => return Ok(Value::Array(chunks)),
                        Some(StreamEvent::Failed(e)) => return Err(e),
                        None => return Err(closed_early(id)),
                    }
                }
            }
        }
    }

    /// Like [`collect`](Self::collect), bounded by an optional timeout
    pub async fn collect_within(self, limit: Option<Duration>) -> Result<Value> {
        let id = self.id();
        match limit {
            Some(limit) => tokio::time::timeout(limit, self.collect())
                .await
                .map_err(|_| {
                    warn!(request_id = %id, "Request timed out after {:?}", limit);
                    BatchLoopError::timeout(format!("no response within {:?}", limit))
                })?,
            None => self.collect().await,
        }
    }

    /// Ordered chunk stream.
    ///
    /// Yields each chunk as it arrives and ends after the final marker. A
    /// failure marker, or a producer that vanished without one, yields a
    /// single `Err` and ends the stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<Value>> {
        match self {
            ResponseHandle::NonStreaming { id, rx } => async_stream::stream! {
                match rx.await {
                    Ok(result) => yield result,
                    Err(_) => yield Err(closed_early(id)),
                }
            }
            .boxed(),
            ResponseHandle::Streaming { id, mut rx } => async_stream::stream! {
                loop {
                    match rx.recv().await {
                        Some(StreamEvent::Chunk(chunk)) => yield Ok(chunk),
                        Some(StreamEvent::End) => break,
                        Some(StreamEvent::Failed(e)) => {
                            yield Err(e);
                            break;
                        }
                        None => {
                            yield Err(closed_early(id));
                            break;
                        }
                    }
                }
            }
            .boxed(),
        }
    }
}
