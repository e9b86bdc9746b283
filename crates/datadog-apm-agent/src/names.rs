// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric, segment and event names.

pub const WEB_TRANSACTION: &str = "WebTransaction";
pub const OTHER_TRANSACTION: &str = "OtherTransaction";

pub const ON_REQUIRE: &str = "Supportability/Features/Instrumentation/OnRequire";

pub const TIMERS_SET_TIMEOUT: &str = "timers.setTimeout";

pub const CUSTOM_EVENT_DROPPED: &str = "Supportability/Events/Customer/Dropped";
pub const CUSTOM_EVENT_SEEN: &str = "Supportability/Events/Customer/Seen";

pub mod events {
    pub const SPAN: &str = "Span";
    pub const TRANSACTION_ERROR: &str = "TransactionError";
    pub const LLM_CHAT_COMPLETION_MESSAGE: &str = "LlmChatCompletionMessage";
    pub const LLM_CHAT_COMPLETION_SUMMARY: &str = "LlmChatCompletionSummary";
}

pub mod openai {
    pub const COMPLETION: &str = "AI/OpenAI/Chat/Completions/Create";
    pub const TRACKING_PREFIX: &str = "Supportability/ML/OpenAI";
    pub const VENDOR: &str = "openAI";
    pub const INGEST_SOURCE: &str = "Rust";
}

pub const LLM_CONVERSATION_ID: &str = "llm.conversation_id";

pub fn on_require(module_name: &str) -> String {
    format!("{ON_REQUIRE}/{module_name}")
}

pub fn on_require_version(module_name: &str, major_version: &str) -> String {
    format!("{ON_REQUIRE}/{module_name}/Version/{major_version}")
}
