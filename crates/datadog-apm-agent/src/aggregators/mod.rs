// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory buffers for finished telemetry, drained by the harvester.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{trace, warn};

use crate::config::AgentConfig;
use crate::names;
use crate::transaction::FinishedTransaction;

pub mod events;
pub mod metrics;

pub use events::{CustomEvent, ErrorEvent, EventAggregator, SpanEvent};
pub use metrics::{MetricAggregator, MetricKey, MetricStats, MetricsPayload};

pub const MAX_EVENT_TYPE_LENGTH: usize = 255;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum AggregatedEvent {
    Custom(CustomEvent),
    Span(SpanEvent),
    Error(ErrorEvent),
}

impl AggregatedEvent {
    pub fn event_type(&self) -> &str {
        match self {
            AggregatedEvent::Custom(event) => &event.event_type,
            AggregatedEvent::Span(_) => names::events::SPAN,
            AggregatedEvent::Error(_) => names::events::TRANSACTION_ERROR,
        }
    }
}

/// Everything buffered since the previous harvest.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HarvestPayload {
    pub custom_events: Vec<CustomEvent>,
    pub span_events: Vec<SpanEvent>,
    pub error_events: Vec<ErrorEvent>,
    pub metrics: MetricsPayload,
}

impl HarvestPayload {
    pub fn is_empty(&self) -> bool {
        self.custom_events.is_empty()
            && self.span_events.is_empty()
            && self.error_events.is_empty()
            && self.metrics.is_empty()
    }
}

pub fn is_valid_event_type(event_type: &str) -> bool {
    static EVENT_TYPE: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = EVENT_TYPE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9:_ ]+$").ok());
    event_type.len() <= MAX_EVENT_TYPE_LENGTH
        && pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(event_type))
}

#[derive(Debug)]
pub struct Aggregators {
    pub custom_events: EventAggregator<CustomEvent>,
    pub span_events: EventAggregator<SpanEvent>,
    pub error_events: EventAggregator<ErrorEvent>,
    pub metrics: MetricAggregator,
}

impl Aggregators {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            custom_events: EventAggregator::new(config.max_custom_events),
            span_events: EventAggregator::new(config.max_span_events),
            error_events: EventAggregator::new(config.max_error_events),
            metrics: MetricAggregator::new(),
        }
    }

    pub fn add_event(&mut self, event: AggregatedEvent) {
        trace!("Buffering {} event", event.event_type());
        match event {
            AggregatedEvent::Custom(event) => self.custom_events.add(event),
            AggregatedEvent::Span(event) => self.span_events.add(event),
            AggregatedEvent::Error(event) => self.error_events.add(event),
        }
    }

    /// Turns an ended transaction into events and metrics.
    pub fn add_transaction(&mut self, transaction: FinishedTransaction) {
        let scope = transaction.metric_name();
        self.metrics.record(&scope, None, transaction.duration);

        for segment in &transaction.segments {
            if segment.parent.is_some() {
                self.metrics
                    .record(&segment.name, Some(&scope), segment.duration);
            }
            self.span_events
                .add(SpanEvent::from_segment(&transaction, segment));
        }

        for exception in &transaction.exceptions {
            self.error_events
                .add(ErrorEvent::from_exception(&transaction, exception));
        }

        for event in transaction.events {
            self.add_event(event);
        }
    }

    pub fn drain(&mut self) -> HarvestPayload {
        let seen = self.custom_events.seen();
        let dropped = self.custom_events.dropped();
        if dropped > 0 {
            warn!("Dropped {dropped} of {seen} custom events since the last harvest");
            self.metrics
                .get_or_create_metric(names::CUSTOM_EVENT_DROPPED, None)
                .increment_call_count(dropped);
        }
        if seen > 0 {
            self.metrics
                .get_or_create_metric(names::CUSTOM_EVENT_SEEN, None)
                .increment_call_count(seen);
        }

        HarvestPayload {
            custom_events: self.custom_events.drain(),
            span_events: self.span_events.drain(),
            error_events: self.error_events.drain(),
            metrics: self.metrics.drain(),
        }
    }

    pub fn clear(&mut self) {
        self.custom_events.clear();
        self.span_events.clear();
        self.error_events.clear();
        self.metrics.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_event_type_validation() {
        assert!(is_valid_event_type("Purchase"));
        assert!(is_valid_event_type("My Event:type_1"));
        assert!(!is_valid_event_type("bad-type"));
        assert!(!is_valid_event_type(""));
        assert!(!is_valid_event_type(&"a".repeat(256)));
        assert!(is_valid_event_type(&"a".repeat(255)));
    }

    #[test]
    fn test_drain_reports_custom_event_counts() {
        let config = AgentConfig {
            max_custom_events: 1,
            ..AgentConfig::default()
        };
        let mut aggregators = Aggregators::new(&config);
        aggregators.add_event(AggregatedEvent::Custom(CustomEvent::new("A", Map::new())));
        aggregators.add_event(AggregatedEvent::Custom(CustomEvent::new("B", Map::new())));

        let payload = aggregators.drain();
        assert_eq!(payload.custom_events.len(), 1);
        assert_eq!(payload.custom_events[0].event_type, "B");
        assert_eq!(
            payload
                .metrics
                .get(names::CUSTOM_EVENT_DROPPED, None)
                .map(|stats| stats.call_count),
            Some(1)
        );
        assert_eq!(
            payload
                .metrics
                .get(names::CUSTOM_EVENT_SEEN, None)
                .map(|stats| stats.call_count),
            Some(2)
        );
        assert!(aggregators.drain().is_empty());
    }
}
