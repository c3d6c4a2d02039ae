//! Streaming response bodies
//!
//! Plain streams are newline-delimited JSON, one object per chunk. Chat
//! streams are server-sent events ending with `data: [DONE]`.

use crate::error::ApiError;
use axum::body::Body;
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use batchloop_common::error::Result;
use batchloop_proto::ChatCompletionChunk;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::convert::Infallible;
use tracing::warn;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Write NDJSON lines as they arrive.
///
/// A failure after the first line is written as one final error object, so
/// every line the client received stays well-formed.
pub fn ndjson_response(lines: BoxStream<'static, Result<Bytes>>) -> Response {
    let body = async_stream::stream! {
        let mut lines = lines;

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => yield Ok::<_, Infallible>(line),
                Err(e) => {
                    let mut data = serde_json::to_vec(&ApiError(e).body()).unwrap_or_default();
                    data.push(b'\n');
                    yield Ok(Bytes::from(data));
                    return;
                }
            }
        }
    };

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response()
}

/// Create SSE stream for chat completions
pub fn chat_event_stream(
    chunks: BoxStream<'static, Result<ChatCompletionChunk>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut chunks = chunks;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => match serde_json::to_string(&chunk) {
                    Ok(data) => yield Ok(Event::default().data(data)),
                    Err(e) => {
                        warn!("Failed to serialize chat chunk: {}", e);
                        return;
                    }
                },
                Err(e) => {
                    let body = ApiError(e).body();
                    let data = serde_json::to_string(&body).unwrap_or_default();
                    yield Ok(Event::default().event("error").data(data));
                    return;
                }
            }
        }

        // Send [DONE] marker
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream)
}
