// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::CallError;
use crate::transaction::{epoch_millis, Exception, FinishedSegment, FinishedTransaction};

/// Bounded FIFO buffer of finished events. The oldest event is evicted once full.
#[derive(Debug, Clone)]
pub struct EventAggregator<E> {
    events: VecDeque<E>,
    capacity: usize,
    seen: u64,
    dropped: u64,
}

impl<E> EventAggregator<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            seen: 0,
            dropped: 0,
        }
    }

    pub fn add(&mut self, event: E) {
        self.seen += 1;
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.events.len() >= self.capacity {
            warn!(
                "Event queue is full ({} events), dropping oldest event",
                self.capacity
            );
            self.events.pop_front();
            self.dropped += 1;
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> impl Iterator<Item = &E> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Takes every buffered event and resets the counters.
    pub fn drain(&mut self) -> Vec<E> {
        self.seen = 0;
        self.dropped = 0;
        self.events.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.seen = 0;
        self.dropped = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: u64,
    pub attributes: Map<String, Value>,
}

impl CustomEvent {
    pub fn new(event_type: &str, attributes: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: epoch_millis(SystemTime::now()),
            attributes,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    pub guid: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub name: String,
    pub timestamp: u64,
    /// Seconds.
    pub duration: f64,
    #[serde(rename = "nr.entryPoint", skip_serializing_if = "std::ops::Not::not")]
    pub entry_point: bool,
    pub incomplete: bool,
    pub attributes: Map<String, Value>,
}

impl SpanEvent {
    pub fn from_segment(transaction: &FinishedTransaction, segment: &FinishedSegment) -> Self {
        Self {
            trace_id: transaction.trace_id.clone(),
            guid: segment.span_id.clone(),
            parent_id: segment.parent_span_id.clone(),
            transaction_id: transaction.id.clone(),
            name: segment.name.clone(),
            timestamp: epoch_millis(transaction.start_time + segment.start_offset),
            duration: segment.duration.as_secs_f64(),
            entry_point: segment.parent.is_none(),
            incomplete: segment.incomplete,
            attributes: segment.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    #[serde(rename = "error.class")]
    pub error_class: String,
    #[serde(rename = "error.message")]
    pub error_message: String,
    #[serde(rename = "transactionName")]
    pub transaction_name: String,
    #[serde(rename = "transactionId")]
    pub transaction_id: Option<String>,
    pub timestamp: u64,
    #[serde(rename = "customAttributes")]
    pub custom_attributes: Map<String, Value>,
    #[serde(rename = "agentAttributes")]
    pub agent_attributes: Map<String, Value>,
}

impl ErrorEvent {
    pub fn from_exception(transaction: &FinishedTransaction, exception: &Exception) -> Self {
        let mut custom_attributes = transaction.custom_attributes.clone();
        custom_attributes.extend(exception.custom_attributes.clone());
        let mut agent_attributes = transaction.agent_attributes.clone();
        agent_attributes.extend(exception.agent_attributes.clone());

        Self {
            error_class: exception.error_class().to_string(),
            error_message: exception.message().to_string(),
            transaction_name: transaction.metric_name(),
            transaction_id: Some(transaction.id.clone()),
            timestamp: epoch_millis(exception.timestamp),
            custom_attributes,
            agent_attributes,
        }
    }

    /// An error noticed while no transaction was active.
    pub fn unscoped(error: &CallError, custom_attributes: Map<String, Value>) -> Self {
        Self {
            error_class: error.name.clone(),
            error_message: error.message.clone(),
            transaction_name: "Unknown".to_string(),
            transaction_id: None,
            timestamp: epoch_millis(SystemTime::now()),
            custom_attributes,
            agent_attributes: Map::new(),
        }
    }
}
