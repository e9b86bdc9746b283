// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chat-completion instrumentation for the `openai` client package.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context;
use crate::error::CallError;
use crate::llm::{ChatCompletionMessage, ChatCompletionSummary};
use crate::module::Invocation;
use crate::names;
use crate::shim::{RecordSpec, Shim};
use crate::shimmer::InstrumentationRegistration;
use crate::transaction::{new_trace_id, Exception, Segment};

pub const MODULE_NAME: &str = "openai";
pub const CHAT_COMPLETIONS_CREATE: &str = "chat.completions.create";

pub fn registration() -> InstrumentationRegistration {
    InstrumentationRegistration::new(MODULE_NAME).on_require(|shim, exports, _| {
        if !shim.agent().config().ai_monitoring_enabled {
            debug!("AI monitoring is disabled, not instrumenting {MODULE_NAME}");
            return Ok(());
        }
        if !shim.record(exports, CHAT_COMPLETIONS_CREATE, describe_create) {
            debug!(
                "{MODULE_NAME}@{} exposes no {CHAT_COMPLETIONS_CREATE} to record",
                shim.module_version()
            );
        }
        Ok(())
    })
}

fn describe_create(shim: &Shim, invocation: &Invocation) -> Option<RecordSpec> {
    context::current_transaction()?;

    shim.agent().aggregators().metrics.increment(&format!(
        "{}/{}",
        names::openai::TRACKING_PREFIX,
        shim.module_version()
    ));

    let spec = RecordSpec::new(names::openai::COMPLETION);
    let request = invocation.arg(0).cloned().unwrap_or(Value::Null);
    if request.get("stream").and_then(Value::as_bool) == Some(true) {
        return Some(spec.after_stream(move |shim, segment, summary| {
            let response = assemble_stream(&summary.chunks);
            record_chat_completion(shim, segment, &request, &response, summary.error.as_ref());
        }));
    }
    Some(spec.after(move |shim, segment, result| {
        let no_response = Value::Null;
        let (response, error) = match result {
            Ok(response) => (response, None),
            Err(error) => (&no_response, Some(error)),
        };
        record_chat_completion(shim, segment, &request, response, error);
    }))
}

/// Folds streamed chunks into the shape of a non-streamed response: deltas are concatenated
/// into one message per choice index.
fn assemble_stream(chunks: &[Value]) -> Value {
    let mut response = Map::new();
    let mut choices: Vec<(Option<String>, String, Value)> = Vec::new();

    for chunk in chunks {
        for key in ["id", "model", "headers"] {
            if let Some(value) = chunk.get(key) {
                response.entry(key).or_insert_with(|| value.clone());
            }
        }
        for choice in chunk.get("choices").and_then(Value::as_array).into_iter().flatten() {
            let index = choice
                .get("index")
                .and_then(Value::as_u64)
                .and_then(|index| usize::try_from(index).ok())
                .unwrap_or(0);
            if choices.len() <= index {
                choices.resize_with(index + 1, || (None, String::new(), Value::Null));
            }
            let (role, content, finish_reason) = &mut choices[index];
            let delta = choice.get("delta");
            if let Some(value) = delta.and_then(|delta| delta.get("role")).and_then(Value::as_str) {
                role.get_or_insert_with(|| value.to_string());
            }
            if let Some(value) = delta.and_then(|delta| delta.get("content")).and_then(Value::as_str) {
                content.push_str(value);
            }
            if let Some(value) = choice.get("finish_reason").filter(|value| !value.is_null()) {
                *finish_reason = value.clone();
            }
        }
    }

    let choices: Vec<Value> = choices
        .into_iter()
        .enumerate()
        .map(|(index, (role, content, finish_reason))| {
            let role = role.unwrap_or_else(|| "assistant".to_string());
            json!({
                "index": index,
                "finish_reason": finish_reason,
                "message": {"role": role, "content": content},
            })
        })
        .collect();
    response.insert("choices".to_string(), Value::Array(choices));
    Value::Object(response)
}

fn record_chat_completion(
    shim: &Shim,
    segment: &Segment,
    request: &Value,
    response: &Value,
    error: Option<&CallError>,
) {
    let config = shim.agent().config();
    let transaction = segment.transaction();
    let completion_id = new_trace_id();

    let summary =
        ChatCompletionSummary::new(config, segment, request, response, &completion_id, error.is_some());

    let request_messages = request
        .get("messages")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|message| (message, false));
    let response_messages = response
        .get("choices")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|choice| choice.get("message"))
        .map(|message| (message, true));

    for (index, (message, is_response)) in request_messages.chain(response_messages).enumerate() {
        let message = ChatCompletionMessage::new(
            config,
            segment,
            response,
            &completion_id,
            message,
            index,
            is_response,
        );
        if let Some(event) = message.to_event() {
            transaction.queue_event(event);
        }
    }
    if let Some(event) = summary.to_event() {
        transaction.queue_event(event);
    }

    if let Some(error) = error {
        transaction.record_exception(
            Exception::new(error.clone())
                .with_custom_attributes(error_attributes(error, &completion_id))
                .with_agent_attributes(Map::from_iter([(
                    "spanId".to_string(),
                    Value::String(segment.span_id()),
                )])),
        );
    }
}

fn error_attributes(error: &CallError, completion_id: &str) -> Map<String, Value> {
    let mut attributes = Map::new();
    attributes.insert("http.statusCode".to_string(), json!(error.status));
    attributes.insert("error.message".to_string(), json!(error.message));
    attributes.insert("error.code".to_string(), json!(error.code));
    attributes.insert("error.param".to_string(), json!(error.param));
    attributes.insert("completion_id".to_string(), json!(completion_id));
    attributes
}
