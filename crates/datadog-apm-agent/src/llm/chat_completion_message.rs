// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;
use serde_json::Value;

use super::{string_field, to_custom_event, LlmEvent};
use crate::aggregators::AggregatedEvent;
use crate::config::AgentConfig;
use crate::names;
use crate::transaction::Segment;

/// One turn of a chat completion: a request message or a response choice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionMessage {
    #[serde(flatten)]
    pub base: LlmEvent,
    pub content: Option<String>,
    pub role: Option<String>,
    pub sequence: usize,
    pub completion_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_response: bool,
}

impl ChatCompletionMessage {
    /// `index` counts request messages first, then response choices.
    pub fn new(
        config: &AgentConfig,
        segment: &Segment,
        response: &Value,
        completion_id: &str,
        message: &Value,
        index: usize,
        is_response: bool,
    ) -> Self {
        let response_id = string_field(response, "id").unwrap_or_else(|| completion_id.to_string());
        Self {
            base: LlmEvent::new(format!("{response_id}-{index}"), config, segment, response),
            content: string_field(message, "content"),
            role: string_field(message, "role"),
            sequence: index,
            completion_id: completion_id.to_string(),
            is_response,
        }
    }

    pub fn to_event(&self) -> Option<AggregatedEvent> {
        to_custom_event(names::events::LLM_CHAT_COMPLETION_MESSAGE, self)
    }
}
