// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock module implementations and sinks for testing

use std::path::Path;
use std::sync::Mutex;

use datadog_apm_agent::aggregators::HarvestPayload;
use datadog_apm_agent::error::{CallError, HarvestError, LoadError};
use datadog_apm_agent::harvester::HarvestSink;
use datadog_apm_agent::module::{CallResult, ChunkStream, Completion, Exports, Function, ModuleRecord};
use serde_json::{json, Value};

pub const CHAT_COMPLETION_ID: &str = "chatcmpl-87sb95K4EF2nuJRcTs43Tm9ntTeat";
pub const INVALID_API_KEY_PROMPT: &str = "Invalid API key.";
pub const STREAM_COMPLETION_ID: &str = "chatcmpl-8MzOfSMbLxEy70lYAolSwdCzfguQZ";
pub const STREAMED_REPLY: &str = "A streamed reply that arrives one word at a time.";
pub const BAD_STREAM_PROMPT: &str = "bad stream";

/// Materializes exports for the fixture packages.
pub fn provide(file: &Path, record: Option<&ModuleRecord>) -> Result<Exports, LoadError> {
    let Some(record) = record else {
        return Err(LoadError::Unsupported(file.to_path_buf()));
    };
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let exports = match (record.name.as_str(), file_name.as_str()) {
        ("customTestPackage", "custom.js") => {
            Exports::callable(Function::new("customFunction", |_| Completion::ok(json!("custom"))))
        }
        ("customTestPackage", _) => {
            let version = record.version.clone();
            Exports::new()
                .with_function(
                    "hello",
                    Function::new("hello", move |_| {
                        Completion::ok(json!(format!("hello from {version}")))
                    }),
                )
                .with_value("version", json!(record.version))
        }
        ("openai", _) => openai_exports(),
        ("knex", _) => Exports::callable(Function::new("knex", |_| Completion::ok(json!({})))),
        ("mongodb", "collection.js") => Exports::callable(mongodb_collection()),
        ("mongodb", _) => mongodb_exports(),
        _ => Exports::new(),
    };
    Ok(exports)
}

/// The driver's callable entry point, as an application would hold it.
pub fn mongodb_exports() -> Exports {
    Exports::callable(Function::constructor("MongoClient", |_| Completion::ok(json!({}))))
}

fn mongodb_collection() -> Function {
    Function::constructor("Collection", |_| Completion::ok(json!({})))
}

/// A chat-completions client answering from canned responses.
pub fn openai_exports() -> Exports {
    let create = Function::new("create", |invocation| {
        let request = invocation.arg(0).cloned().unwrap_or(Value::Null);
        if request["stream"] == json!(true) {
            return Completion::stream(stream_chunks(&request));
        }
        Completion::deferred(async move {
            tokio::task::yield_now().await;
            respond(&request)
        })
    });
    Exports::new().with_object(
        "chat",
        Exports::new().with_object("completions", Exports::new().with_function("create", create)),
    )
}

fn respond(request: &Value) -> Result<Value, CallError> {
    let prompt = request["messages"][0]["content"].as_str().unwrap_or_default();
    if prompt == INVALID_API_KEY_PROMPT {
        return Err(CallError::new(
            "AuthenticationError",
            "Incorrect API key provided: invalid. You can find your API key at https://platform.openai.com/account/api-keys.",
        )
        .with_status(401)
        .with_code("invalid_api_key")
        .with_param("null"));
    }
    Ok(json!({
        "id": CHAT_COMPLETION_ID,
        "object": "chat.completion",
        "model": "gpt-3.5-turbo-0613",
        "headers": {
            "x-request-id": "49dbbffbd3c3f4612aa48def69059aad",
            "openai-organization": "datadog-test-org"
        },
        "choices": [{
            "index": 0,
            "finish_reason": "stop",
            "message": {"role": "assistant", "content": "1 plus 2 is 3."}
        }],
        "usage": {"prompt_tokens": 53, "completion_tokens": 11, "total_tokens": 64}
    }))
}

/// One chunk per word of [`STREAMED_REPLY`]; the bad-stream prompt fails before the last one.
fn stream_chunks(request: &Value) -> ChunkStream {
    let prompt = request["messages"][0]["content"].as_str().unwrap_or_default();
    let chunk = |delta: Value, finish_reason: Value| {
        Ok(json!({
            "id": STREAM_COMPLETION_ID,
            "object": "chat.completion.chunk",
            "model": "gpt-4",
            "headers": {"x-request-id": "5db943f509e9707e8e1e7cb0b7ef3a4f"},
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}]
        }))
    };

    let mut items: Vec<CallResult> = vec![chunk(json!({"role": "assistant"}), Value::Null)];
    items.extend(
        STREAMED_REPLY
            .split_inclusive(' ')
            .map(|word| chunk(json!({"content": word}), Value::Null)),
    );
    if prompt == BAD_STREAM_PROMPT {
        items.pop();
        items.push(Err(CallError::new("Error", "Premature close")));
    } else {
        items.push(chunk(json!({}), json!("stop")));
    }
    ChunkStream::from_items(items)
}

/// Harvest sink that keeps every payload in memory
#[derive(Default)]
#[allow(dead_code)]
pub struct MemorySink {
    pub payloads: Mutex<Vec<HarvestPayload>>,
}

#[async_trait::async_trait]
impl HarvestSink for MemorySink {
    async fn send(&self, payload: &HarvestPayload) -> Result<(), HarvestError> {
        self.payloads
            .lock()
            .expect("lock")
            .push(payload.clone());
        Ok(())
    }
}
