//! Chat-completion protocol adapter
//!
//! Translates chat requests into the generic input handed to the predict
//! routine, and routine outputs back into chat responses or stream chunks.
//! Image parts are forwarded as opaque references; decoding them is the
//! routine's business.

use batchloop_common::error::{BatchLoopError, Result};
use batchloop_proto::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatDelta,
    ChunkChoice, ContentPart, MessageContent, ResponseMessage, Usage, CHAT_COMPLETION_CHUNK_OBJECT,
    CHAT_COMPLETION_OBJECT,
};
use serde_json::{json, Map, Value};

const ASSISTANT: &str = "assistant";
const FINISH_STOP: &str = "stop";

fn encode_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { image_url } => {
                        json!({"type": "image_url", "image_url": image_url.url()})
                    }
                })
                .collect(),
        ),
    }
}

/// Build the routine input for a chat request.
///
/// Messages keep their order and roles; content parts keep their order
/// within each message.
pub fn encode_request(request: &ChatCompletionRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": encode_content(&message.content),
            })
        })
        .collect();

    let mut parameters = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        parameters.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        parameters.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        parameters.insert("top_p".into(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        parameters.insert("stop".into(), json!(stop));
    }

    json!({
        "model": request.model,
        "messages": messages,
        "stream": request.is_stream(),
        "parameters": parameters,
    })
}

/// Text carried by one routine output.
///
/// Accepts a string, an object with a string `content`, `null`, or an array
/// of those (the buffered chunks of a streaming routine).
pub fn output_text(output: &Value) -> Result<String> {
    match output {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text.clone()),
        Value::Object(object) => match object.get("content") {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(Value::Null) | None => Ok(String::new()),
            Some(other) => Err(BatchLoopError::prediction(format!(
                "chat output content must be a string, got {}",
                other
            ))),
        },
        Value::Array(items) => items.iter().map(output_text).collect(),
        other => Err(BatchLoopError::prediction(format!(
            "chat output must be text, got {}",
            other
        ))),
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// Wrap a complete output in a single-choice response
pub fn decode_result(model: &str, output: &Value) -> Result<ChatCompletionResponse> {
    Ok(ChatCompletionResponse {
        id: completion_id(),
        object: CHAT_COMPLETION_OBJECT.to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: ASSISTANT.to_string(),
                content: output_text(output)?,
            },
            finish_reason: Some(FINISH_STOP.to_string()),
        }],
        usage: Usage::default(),
    })
}

/// Turns streamed outputs into chat chunks sharing one completion id
#[derive(Debug)]
pub struct ChatStreamEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
}

impl ChatStreamEncoder {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: completion_id(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
        }
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<&str>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: CHAT_COMPLETION_CHUNK_OBJECT.to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    /// Delta for one intermediate output; `None` when it carries no text
    pub fn delta(&mut self, output: &Value) -> Result<Option<ChatCompletionChunk>> {
        let text = output_text(output)?;
        if text.is_empty() {
            return Ok(None);
        }

        let role = (!self.role_sent).then(|| ASSISTANT.to_string());
        self.role_sent = true;

        Ok(Some(self.chunk(
            ChatDelta {
                role,
                content: Some(text),
            },
            None,
        )))
    }

    /// Terminal chunk: content explicitly `null`
    pub fn finish(&self) -> ChatCompletionChunk {
        self.chunk(ChatDelta::default(), Some(FINISH_STOP))
    }
}
