// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! LLM telemetry events built from a chat-completion request/response pair.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::aggregators::{AggregatedEvent, CustomEvent};
use crate::config::AgentConfig;
use crate::names;
use crate::transaction::Segment;

pub mod chat_completion_message;
pub mod chat_completion_summary;

pub use chat_completion_message::ChatCompletionMessage;
pub use chat_completion_summary::ChatCompletionSummary;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Attributes shared by every LLM event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmEvent {
    pub id: String,
    #[serde(rename = "appName")]
    pub app_name: String,
    pub request_id: Option<String>,
    pub trace_id: String,
    pub span_id: String,
    pub transaction_id: String,
    #[serde(rename = "response.model")]
    pub response_model: Option<String>,
    pub vendor: String,
    pub ingest_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl LlmEvent {
    pub fn new(id: String, config: &AgentConfig, segment: &Segment, response: &Value) -> Self {
        let transaction = segment.transaction();
        Self {
            id,
            app_name: config.service.clone(),
            request_id: response_header(response, REQUEST_ID_HEADER),
            trace_id: transaction.trace_id().to_string(),
            span_id: segment.span_id(),
            transaction_id: transaction.id().to_string(),
            response_model: string_field(response, "model"),
            vendor: names::openai::VENDOR.to_string(),
            ingest_source: names::openai::INGEST_SOURCE.to_string(),
            conversation_id: transaction
                .custom_attribute(names::LLM_CONVERSATION_ID)
                .and_then(|value| value.as_str().map(str::to_string)),
        }
    }
}

pub(crate) fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn response_header(response: &Value, header: &str) -> Option<String> {
    response
        .get("headers")
        .and_then(|headers| headers.get(header))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Flattens an LLM event into a custom event of `event_type`.
pub(crate) fn to_custom_event<T: Serialize>(event_type: &str, event: &T) -> Option<AggregatedEvent> {
    match serde_json::to_value(event) {
        Ok(Value::Object(attributes)) => Some(AggregatedEvent::Custom(CustomEvent::new(
            event_type, attributes,
        ))),
        Ok(other) => {
            warn!("{event_type} serialized to a non-object value: {other}");
            None
        }
        Err(err) => {
            warn!("Failed to serialize {event_type}: {err}");
            None
        }
    }
}
