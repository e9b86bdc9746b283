// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use serde_json::Value;

use super::{response_header, string_field, to_custom_event, LlmEvent};
use crate::aggregators::AggregatedEvent;
use crate::config::AgentConfig;
use crate::names;
use crate::transaction::Segment;

const ORGANIZATION_HEADER: &str = "openai-organization";

/// One per chat-completion call, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionSummary {
    #[serde(flatten)]
    pub base: LlmEvent,
    /// Milliseconds.
    pub duration: f64,
    #[serde(rename = "request.model")]
    pub request_model: Option<String>,
    #[serde(rename = "request.max_tokens")]
    pub request_max_tokens: Option<u64>,
    #[serde(rename = "request.temperature")]
    pub request_temperature: Option<f64>,
    #[serde(rename = "response.number_of_messages")]
    pub number_of_messages: usize,
    #[serde(rename = "response.choices.finish_reason")]
    pub finish_reason: Option<String>,
    #[serde(rename = "response.organization")]
    pub organization: Option<String>,
    #[serde(rename = "response.usage.prompt_tokens")]
    pub prompt_tokens: Option<u64>,
    #[serde(rename = "response.usage.completion_tokens")]
    pub completion_tokens: Option<u64>,
    #[serde(rename = "response.usage.total_tokens")]
    pub total_tokens: Option<u64>,
    pub error: bool,
}

impl ChatCompletionSummary {
    pub fn new(
        config: &AgentConfig,
        segment: &Segment,
        request: &Value,
        response: &Value,
        completion_id: &str,
        error: bool,
    ) -> Self {
        let request_messages = request
            .get("messages")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        let choices = response.get("choices").and_then(Value::as_array);
        let usage = |key: &str| {
            response
                .get("usage")
                .and_then(|usage| usage.get(key))
                .and_then(Value::as_u64)
        };

        Self {
            base: LlmEvent::new(completion_id.to_string(), config, segment, response),
            duration: segment.elapsed().as_secs_f64() * 1000.0,
            request_model: string_field(request, "model"),
            request_max_tokens: request.get("max_tokens").and_then(Value::as_u64),
            request_temperature: request.get("temperature").and_then(Value::as_f64),
            number_of_messages: request_messages + choices.map_or(0, Vec::len),
            finish_reason: choices
                .and_then(|choices| choices.first())
                .and_then(|choice| string_field(choice, "finish_reason")),
            organization: response_header(response, ORGANIZATION_HEADER),
            prompt_tokens: usage("prompt_tokens"),
            completion_tokens: usage("completion_tokens"),
            total_tokens: usage("total_tokens"),
            error,
        }
    }

    pub fn to_event(&self) -> Option<AggregatedEvent> {
        to_custom_event(names::events::LLM_CHAT_COMPLETION_SUMMARY, self)
    }
}
