//! Serving engine
//!
//! Owns the worker pool and sits between the HTTP handlers and the
//! scheduler. Plain requests enter as raw bytes and leave as bytes: one
//! JSON document, or newline-delimited JSON with one object per chunk.
//! Chat requests enter parsed and leave as protocol objects.

use crate::openai::{self, ChatStreamEncoder};
use batchloop_common::error::{BatchLoopError, Result};
use batchloop_common::{ServerConfig, METRICS};
use batchloop_proto::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use batchloop_worker::{
    BatchScheduler, Codec, PredictorFactory, ResponseHandle, ResponseMode, WorkerPool,
};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Result of a plain predict request, already framed for the wire
pub enum EngineResponse {
    Complete(Bytes),
    Stream(BoxStream<'static, Result<Bytes>>),
}

/// Result of a chat-completion request
pub enum ChatReply {
    Complete(ChatCompletionResponse),
    Stream(BoxStream<'static, Result<ChatCompletionChunk>>),
}

/// Request bookkeeping for the request metrics. Anything dropped without an
/// outcome (client went away, timeout) counts as failed.
struct InFlight {
    start: Instant,
    succeeded: Option<bool>,
}

impl InFlight {
    fn begin() -> Self {
        METRICS.requests.requests_total.inc();
        METRICS.requests.active_requests.inc();
        Self {
            start: Instant::now(),
            succeeded: None,
        }
    }

    fn finish(&mut self, succeeded: bool) {
        self.succeeded = Some(succeeded);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        METRICS.requests.active_requests.dec();
        METRICS
            .requests
            .request_duration
            .observe(self.start.elapsed().as_secs_f64());

        if self.succeeded == Some(true) {
            METRICS.requests.requests_success.inc();
        } else {
            METRICS.requests.requests_failed.inc();
        }
    }
}

fn ndjson_line(codec: &dyn Codec, chunk: Value) -> Result<Bytes> {
    let mut line = serde_json::to_vec(&codec.encode_response(chunk)?)?;
    line.push(b'\n');
    trace!(bytes = line.len(), "Chunk framed");
    Ok(Bytes::from(line))
}

/// Serving engine shared by every connection
pub struct Engine {
    pool: WorkerPool,
    codec: Arc<dyn Codec>,
    request_timeout: Option<Duration>,
}

impl Engine {
    /// Start the worker pool and wait until every replica is ready
    pub async fn start(
        config: &ServerConfig,
        factory: PredictorFactory,
        codec: Arc<dyn Codec>,
    ) -> Result<Arc<Self>> {
        let scheduler = Arc::new(BatchScheduler::new(config.batching.clone()));
        let pool = WorkerPool::start(scheduler, factory, config.workers.num_workers).await?;

        info!(
            "Engine ready (max_batch_size: {}, batch_timeout: {:?}, streaming: {})",
            config.batching.max_batch_size,
            config.batching.batch_timeout(),
            pool.is_streaming()
        );

        Ok(Arc::new(Self {
            pool,
            codec,
            request_timeout: config.request_timeout(),
        }))
    }

    /// Whether plain requests are answered with a stream
    pub fn is_streaming(&self) -> bool {
        self.pool.is_streaming()
    }

    pub fn is_healthy(&self) -> bool {
        self.pool.scheduler().is_healthy()
    }

    fn submit(&self, input: Value, mode: ResponseMode) -> Result<ResponseHandle> {
        let handle = self.pool.scheduler().submit(input, mode)?;
        debug!(request_id = %handle.id(), "Request submitted");
        Ok(handle)
    }

    /// Wait for the first item of a stream under the request timeout.
    ///
    /// Failures that happen before any output reach the client as a plain
    /// error response instead of a truncated stream.
    async fn first_item(
        &self,
        stream: &mut BoxStream<'static, Result<Value>>,
    ) -> Result<Option<Value>> {
        let next = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| BatchLoopError::timeout(format!("no output within {:?}", limit)))?,
            None => stream.next().await,
        };
        next.transpose()
    }

    /// Handle a plain predict request body.
    ///
    /// `stream_hint` selects the response shape: a stream of NDJSON lines
    /// or a single document. A blocking routine answering a streamed request
    /// produces one line; a streaming routine answering a non-streamed
    /// request produces the array of its chunks.
    pub async fn handle_request(&self, raw: &[u8], stream_hint: bool) -> Result<EngineResponse> {
        let mut in_flight = InFlight::begin();

        let result = self.handle_request_inner(raw, stream_hint).await;
        match result {
            Ok(EngineResponse::Stream(stream)) => Ok(EngineResponse::Stream(
                Self::track_stream(stream, in_flight),
            )),
            other => {
                in_flight.finish(other.is_ok());
                other
            }
        }
    }

    async fn handle_request_inner(&self, raw: &[u8], stream_hint: bool) -> Result<EngineResponse> {
        let request: Value = serde_json::from_slice(raw)
            .map_err(|e| BatchLoopError::malformed_input(format!("invalid JSON body: {}", e)))?;
        let input = self.codec.decode_request(request)?;

        if !stream_hint {
            let handle = self.submit(input, ResponseMode::NonStreaming)?;
            let output = handle.collect_within(self.request_timeout).await?;
            let body = serde_json::to_vec(&self.codec.encode_response(output)?)?;
            return Ok(EngineResponse::Complete(Bytes::from(body)));
        }

        let mut stream = self.submit(input, ResponseMode::Streaming)?.into_stream();
        let first = self.first_item(&mut stream).await?;

        let codec = self.codec.clone();
        let encoded = async_stream::stream! {
            if let Some(first) = first {
                yield ndjson_line(codec.as_ref(), first);
            }
            while let Some(item) = stream.next().await {
                yield item.and_then(|chunk| ndjson_line(codec.as_ref(), chunk));
            }
        };

        Ok(EngineResponse::Stream(encoded.boxed()))
    }

    /// Count chunks and stop after the first failure
    fn track_stream<T: Send + 'static>(
        mut stream: BoxStream<'static, Result<T>>,
        mut in_flight: InFlight,
    ) -> BoxStream<'static, Result<T>> {
        async_stream::stream! {
            let mut succeeded = true;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        METRICS.requests.chunks_streamed_total.inc();
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        error!("Stream aborted: {}", e);
                        succeeded = false;
                        yield Err(e);
                        break;
                    }
                }
            }
            in_flight.finish(succeeded);
        }
        .boxed()
    }

    /// Handle a chat-completion request
    pub async fn chat(&self, request: ChatCompletionRequest) -> Result<ChatReply> {
        let mut in_flight = InFlight::begin();

        let result = self.chat_inner(request).await;
        match result {
            Ok(ChatReply::Stream(stream)) => {
                Ok(ChatReply::Stream(Self::track_stream(stream, in_flight)))
            }
            other => {
                in_flight.finish(other.is_ok());
                other
            }
        }
    }

    async fn chat_inner(&self, request: ChatCompletionRequest) -> Result<ChatReply> {
        if request.messages.is_empty() {
            return Err(BatchLoopError::malformed_input("messages must not be empty"));
        }
        let input = openai::encode_request(&request);

        if !request.is_stream() {
            let handle = self.submit(input, ResponseMode::NonStreaming)?;
            let output = handle.collect_within(self.request_timeout).await?;
            return Ok(ChatReply::Complete(openai::decode_result(
                &request.model,
                &output,
            )?));
        }

        let mut stream = self.submit(input, ResponseMode::Streaming)?.into_stream();
        let first = self.first_item(&mut stream).await?;

        let mut encoder = ChatStreamEncoder::new(request.model);
        let chunks = async_stream::stream! {
            if let Some(first) = first {
                match encoder.delta(&first) {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            while let Some(item) = stream.next().await {
                match item.and_then(|output| encoder.delta(&output)) {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            yield Ok(encoder.finish());
        };

        Ok(ChatReply::Stream(chunks.boxed()))
    }

    /// Stop accepting requests and let in-flight batches finish
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
