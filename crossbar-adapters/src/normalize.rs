//! Response normalizer.
//!
//! Upstreams disagree about shape; clients must never notice. Everything
//! leaving the gateway is coerced into the OpenAI envelope here. Already
//! OpenAI-shaped input passes through unchanged apart from the `model`
//! field, which is always rewritten back to the external id the caller
//! asked for.

use crate::error::AdapterError;
use crate::models::{
    ChatResponse, Choice, Delta, Embedding, EmbeddingResponse, Message, Role, StreamChoice,
    StreamChunk, Usage,
};
use serde_json::Value;

/// Coerce a non-streaming chat payload into a [`ChatResponse`].
///
/// Accepts the OpenAI shape, or a bare object carrying the content under
/// `content`, `text`, `response` or `message.content` (common for CLI
/// tools and local servers). Missing usage is zero-filled; a missing
/// finish reason defaults to `"stop"`.
pub fn chat_response(value: Value, external_model: &str) -> Result<ChatResponse, AdapterError> {
    if looks_like_openai_chat(&value) {
        let mut response: ChatResponse = serde_json::from_value(normalize_openai_chat(value))?;
        response.model = external_model.to_string();
        return Ok(response);
    }

    let content = extract_content(&value).ok_or_else(|| {
        AdapterError::permanent("upstream chat payload has no recognizable content")
    })?;

    Ok(ChatResponse {
        id: new_completion_id(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: external_model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: Role::Assistant,
                content,
                name: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: extract_usage(&value),
        system_fingerprint: None,
    })
}

/// Coerce one streaming frame into a [`StreamChunk`].
///
/// `stream_id` and `created` are fixed once per response so every chunk
/// carries the same id. A frame may be OpenAI-shaped or a bare object
/// with a content fragment.
pub fn chat_chunk(
    value: Value,
    external_model: &str,
    stream_id: &str,
    created: u64,
) -> Result<StreamChunk, AdapterError> {
    if value.get("choices").map(Value::is_array).unwrap_or(false) {
        let mut chunk: StreamChunk = serde_json::from_value(value)?;
        chunk.id = stream_id.to_string();
        chunk.created = created;
        chunk.model = external_model.to_string();
        return Ok(chunk);
    }

    let content = extract_content(&value).ok_or_else(|| {
        AdapterError::permanent("upstream stream frame has no recognizable content")
    })?;
    let done = value
        .get("done")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(StreamChunk {
        id: stream_id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: external_model.to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                role: None,
                content: Some(content),
            },
            finish_reason: done.then(|| "stop".to_string()),
        }],
    })
}

/// Terminal chunk closing a stream whose upstream never sent a finish
/// reason of its own.
pub fn finish_chunk(external_model: &str, stream_id: &str, created: u64) -> StreamChunk {
    StreamChunk {
        id: stream_id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: external_model.to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta::default(),
            finish_reason: Some("stop".to_string()),
        }],
    }
}

/// In-band error chunk for failures after the response is committed.
pub fn error_chunk(
    external_model: &str,
    stream_id: &str,
    created: u64,
    message: &str,
) -> Value {
    serde_json::json!({
        "id": stream_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": external_model,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": "error"
        }],
        "details": { "error": { "message": message } }
    })
}

/// Coerce an embeddings payload into the OpenAI list form.
///
/// Four upstream shapes are accepted:
/// - the OpenAI list form (passed through);
/// - a bare nested array `[[0.1, 0.2], ...]`;
/// - a bare flat array `[0.1, 0.2]` (one embedding);
/// - a single-embedding object `{"embedding": [...]}`.
pub fn embeddings(value: Value, external_model: &str) -> Result<EmbeddingResponse, AdapterError> {
    if value.get("object").and_then(Value::as_str) == Some("list")
        && value.get("data").map(Value::is_array).unwrap_or(false)
    {
        let mut response: EmbeddingResponse = serde_json::from_value(value)?;
        response.model = external_model.to_string();
        return Ok(response);
    }

    let usage = extract_usage(&value);
    let vectors: Vec<Vec<f32>> = match &value {
        Value::Array(items) if items.iter().all(Value::is_array) => items
            .iter()
            .map(|row| parse_vector(row))
            .collect::<Result<_, _>>()?,
        Value::Array(_) => vec![parse_vector(&value)?],
        Value::Object(map) => {
            if let Some(embedding) = map.get("embedding") {
                vec![parse_vector(embedding)?]
            } else if let Some(Value::Array(rows)) = map.get("embeddings") {
                rows.iter().map(parse_vector).collect::<Result<_, _>>()?
            } else {
                return Err(AdapterError::permanent(
                    "upstream embeddings payload has no recognizable vectors",
                ));
            }
        }
        _ => {
            return Err(AdapterError::permanent(
                "upstream embeddings payload has no recognizable vectors",
            ))
        }
    };

    Ok(EmbeddingResponse {
        object: "list".to_string(),
        data: vectors
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| Embedding {
                object: "embedding".to_string(),
                embedding,
                index: index as u32,
            })
            .collect(),
        model: external_model.to_string(),
        usage,
    })
}

fn parse_vector(value: &Value) -> Result<Vec<f32>, AdapterError> {
    value
        .as_array()
        .ok_or_else(|| AdapterError::permanent("embedding vector is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| AdapterError::permanent("embedding vector holds a non-number"))
        })
        .collect()
}

fn looks_like_openai_chat(value: &Value) -> bool {
    value
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .all(|c| c.get("message").map(Value::is_object).unwrap_or(false))
        })
        .unwrap_or(false)
}

/// Fill the holes the strict deserializer would trip over: id, created,
/// object tag, usage, finish reasons.
fn normalize_openai_chat(mut value: Value) -> Value {
    let obj = match value.as_object_mut() {
        Some(obj) => obj,
        None => return value,
    };
    obj.entry("id")
        .or_insert_with(|| Value::String(new_completion_id()));
    obj.entry("object")
        .or_insert_with(|| Value::String("chat.completion".to_string()));
    obj.entry("created")
        .or_insert_with(|| Value::Number(now_unix().into()));
    obj.entry("model").or_insert_with(|| Value::String(String::new()));
    if !obj.get("usage").map(Value::is_object).unwrap_or(false) {
        obj.insert(
            "usage".to_string(),
            serde_json::to_value(Usage::default()).unwrap_or(Value::Null),
        );
    }
    if let Some(choices) = obj.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices {
            if let Some(choice) = choice.as_object_mut() {
                let missing = choice
                    .get("finish_reason")
                    .map(Value::is_null)
                    .unwrap_or(true);
                if missing {
                    choice.insert(
                        "finish_reason".to_string(),
                        Value::String("stop".to_string()),
                    );
                }
            }
        }
    }
    value
}

fn extract_content(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    for path in [
        &["content"][..],
        &["text"][..],
        &["response"][..],
        &["message", "content"][..],
    ] {
        let mut cursor = value;
        let mut found = true;
        for key in path {
            match cursor.get(key) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(s) = cursor.as_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Usage from either OpenAI field names or the `*_eval_count` style local
/// servers report. Anything absent counts as zero.
fn extract_usage(value: &Value) -> Usage {
    if let Some(usage) = value.get("usage") {
        if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
            return parsed;
        }
        let prompt = usage
            .get("prompt_tokens")
            .or_else(|| usage.get("input_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let completion = usage
            .get("completion_tokens")
            .or_else(|| usage.get("output_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        return Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        };
    }
    let prompt = value
        .get("prompt_eval_count")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let completion = value
        .get("eval_count")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    }
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn now_unix() -> u64 {
    chrono::Utc::now().timestamp() as u64
}
