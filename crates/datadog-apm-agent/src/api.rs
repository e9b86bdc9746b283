// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Public tracing API for application code.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::aggregators::{is_valid_event_type, AggregatedEvent, CustomEvent, ErrorEvent};
use crate::context::{self, Context, ContextFutureExt};
use crate::error::CallError;
use crate::module::Exports;
use crate::shimmer::InstrumentationRegistration;
use crate::transaction::{is_primitive, Exception, Segment, Transaction, TransactionKind};

#[derive(Debug, Clone)]
pub struct Api {
    agent: Arc<Agent>,
}

impl Api {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Runs `f` inside a new web transaction, ended when `f` returns. Inside an active
    /// transaction, or when the agent is disabled, `f` just runs.
    pub fn start_web_transaction<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        self.with_transaction(TransactionKind::Web, name, f)
    }

    pub fn start_background_transaction<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        self.with_transaction(TransactionKind::Background, name, f)
    }

    /// Async variant of [`Api::start_web_transaction`]: the transaction ends once `future`
    /// completes.
    pub async fn start_web_transaction_async<F>(&self, name: &str, future: F) -> F::Output
    where
        F: Future,
    {
        self.with_transaction_async(TransactionKind::Web, name, future)
            .await
    }

    pub async fn start_background_transaction_async<F>(&self, name: &str, future: F) -> F::Output
    where
        F: Future,
    {
        self.with_transaction_async(TransactionKind::Background, name, future)
            .await
    }

    fn with_transaction<R>(&self, kind: TransactionKind, name: &str, f: impl FnOnce() -> R) -> R {
        let Some(transaction) = self.begin(kind, name) else {
            return f();
        };
        let transaction = EndOnDrop::new(transaction);
        context::run_in_context(Context::for_transaction(&transaction), f)
    }

    async fn with_transaction_async<F: Future>(
        &self,
        kind: TransactionKind,
        name: &str,
        future: F,
    ) -> F::Output {
        let Some(transaction) = self.begin(kind, name) else {
            return future.await;
        };
        let transaction = EndOnDrop::new(transaction);
        future
            .in_context(Context::for_transaction(&transaction))
            .await
    }

    fn begin(&self, kind: TransactionKind, name: &str) -> Option<Arc<Transaction>> {
        if let Some(active) = context::current_transaction() {
            if active.is_active() {
                debug!(
                    "Not starting {name}: transaction {} is already active",
                    active.name()
                );
                return None;
            }
        }
        self.agent.start_transaction(kind, name)
    }

    pub fn get_transaction(&self) -> Option<Arc<Transaction>> {
        context::current_transaction()
    }

    /// Renames the active transaction. Returns `false` outside a transaction.
    pub fn set_transaction_name(&self, name: &str) -> bool {
        let Some(transaction) = context::current_transaction() else {
            debug!("No transaction to rename to {name}");
            return false;
        };
        transaction.set_name(name);
        true
    }

    /// Ends the active transaction. Returns `false` when there is none or it already ended.
    pub fn end_transaction(&self) -> bool {
        context::current_transaction().is_some_and(|transaction| transaction.end())
    }

    /// Runs `f` inside a child segment of the active one. Outside a transaction `f` just runs.
    pub fn start_segment<R>(&self, name: &str, f: impl FnOnce() -> R) -> R {
        let Some(segment) = context::current().create_segment(name) else {
            return f();
        };
        let result = context::run_in_context(segment.context(), f);
        segment.end();
        result
    }

    pub async fn start_segment_async<F: Future>(&self, name: &str, future: F) -> F::Output {
        let Some(segment) = context::current().create_segment(name) else {
            return future.await;
        };
        let output = future.in_context(segment.context()).await;
        segment.end();
        output
    }

    pub fn get_active_segment(&self) -> Option<Segment> {
        context::current_segment()
    }

    pub fn add_custom_attribute(&self, key: &str, value: impl Into<Value>) -> bool {
        let Some(transaction) = context::current_transaction() else {
            debug!("No transaction to add custom attribute {key} to");
            return false;
        };
        transaction.add_custom_attribute(key, value)
    }

    /// Adds every attribute, returning how many were accepted.
    pub fn add_custom_attributes(&self, attributes: Map<String, Value>) -> usize {
        attributes
            .into_iter()
            .filter(|(key, value)| self.add_custom_attribute(key, value.clone()))
            .count()
    }

    /// Records a custom event, held by the active transaction until it ends. Non-primitive
    /// attribute values are dropped.
    pub fn record_custom_event(&self, event_type: &str, attributes: Map<String, Value>) -> bool {
        if !is_valid_event_type(event_type) {
            warn!("Invalid custom event type {event_type:?}, event not recorded");
            return false;
        }
        let attributes: Map<String, Value> = attributes
            .into_iter()
            .filter(|(key, value)| {
                let keep = is_primitive(value);
                if !keep {
                    debug!("Dropping non-primitive attribute {key} from {event_type}");
                }
                keep
            })
            .collect();
        let event = AggregatedEvent::Custom(CustomEvent::new(event_type, attributes));
        match context::current_transaction() {
            Some(transaction) if transaction.is_active() => transaction.queue_event(event),
            _ => {
                self.agent.add_event(event);
                true
            }
        }
    }

    /// Records an application error against the active transaction, or as a standalone error
    /// event outside one.
    pub fn notice_error(&self, error: &CallError, custom_attributes: Map<String, Value>) -> bool {
        match context::current_transaction() {
            Some(transaction) => transaction.record_exception(
                Exception::new(error.clone()).with_custom_attributes(custom_attributes),
            ),
            None => {
                self.agent.add_event(AggregatedEvent::Error(ErrorEvent::unscoped(
                    error,
                    custom_attributes,
                )));
                true
            }
        }
    }

    /// See [`Agent::instrument_loaded_module`].
    pub fn instrument_loaded_module(&self, module_name: &str, exports: &mut Exports) -> bool {
        self.agent.instrument_loaded_module(module_name, exports)
    }

    pub fn register_instrumentation(&self, registration: InstrumentationRegistration) {
        self.agent.register_instrumentation(registration);
    }
}

/// Ends the transaction when dropped, also on unwind or when the future is abandoned.
struct EndOnDrop(Arc<Transaction>);

impl EndOnDrop {
    fn new(transaction: Arc<Transaction>) -> Self {
        Self(transaction)
    }
}

impl Deref for EndOnDrop {
    type Target = Arc<Transaction>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.0.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use serde_json::json;

    fn api() -> Api {
        Api::new(Agent::new(AgentConfig::default()))
    }

    fn attributes(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_web_transaction_ends_after_handler() {
        let api = api();
        let transaction = api.start_web_transaction("/users", || {
            api.start_segment("load", || {
                assert_eq!(
                    api.get_active_segment().map(|segment| segment.name()),
                    Some("load".to_string())
                );
            });
            api.get_transaction().expect("transaction")
        });

        assert!(!transaction.is_active());
        assert!(api.get_transaction().is_none());
        let payload = api.agent().drain();
        assert_eq!(payload.span_events.len(), 2);
        assert!(payload.metrics.get("WebTransaction//users", None).is_some());
    }

    #[test]
    fn test_nested_start_reuses_active_transaction() {
        let api = api();
        api.start_background_transaction("outer", || {
            let outer = api.get_transaction().expect("outer");
            api.start_background_transaction("inner", || {
                let inner = api.get_transaction().expect("inner");
                assert!(Arc::ptr_eq(&outer, &inner));
            });
            assert!(outer.is_active());
        });
    }

    #[tokio::test]
    async fn test_async_transaction_spans_awaits() {
        let api = api();
        let name = api
            .start_background_transaction_async("job", async {
                tokio::task::yield_now().await;
                api.start_segment_async("step", async {
                    tokio::task::yield_now().await;
                })
                .await;
                api.get_transaction().map(|transaction| transaction.name())
            })
            .await;

        assert_eq!(name, Some("job".to_string()));
        assert!(api.get_transaction().is_none());
        assert_eq!(api.agent().drain().span_events.len(), 2);
    }

    #[test]
    fn test_panicking_handler_still_ends_transaction() {
        let api = api();
        let seen = std::sync::Mutex::new(None);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            api.start_web_transaction("/panics", || {
                *seen.lock().expect("lock") = api.get_transaction();
                panic!("handler failed");
            })
        }));

        assert!(outcome.is_err());
        let transaction = seen.into_inner().expect("lock").expect("transaction");
        assert!(!transaction.is_active());
        assert!(api.get_transaction().is_none());
        assert_eq!(api.agent().drain().span_events.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_async_transaction_is_ended() {
        let api = api();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let captured = Arc::clone(&seen);
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(5),
            api.start_web_transaction_async("/slow", async move {
                *captured.lock().expect("lock") = context::current_transaction();
                std::future::pending::<()>().await;
            }),
        )
        .await;

        assert!(timed_out.is_err());
        let transaction = seen.lock().expect("lock").take().expect("transaction");
        assert!(!transaction.is_active());
        assert_eq!(api.agent().drain().span_events.len(), 1);
    }

    #[test]
    fn test_custom_event_in_transaction_is_held_until_end() {
        let api = api();
        api.start_background_transaction("job", || {
            assert!(api.record_custom_event("Step", attributes(json!({"n": 1}))));
            let transaction = api.get_transaction().expect("transaction");
            assert_eq!(transaction.pending_events().len(), 1);
            assert!(api.agent().drain().custom_events.is_empty());
        });

        let payload = api.agent().drain();
        assert_eq!(payload.custom_events.len(), 1);
        assert_eq!(payload.custom_events[0].event_type, "Step");
    }

    #[test]
    fn test_set_transaction_name() {
        let api = api();
        assert!(!api.set_transaction_name("/ignored"));
        api.start_web_transaction("/users/42", || {
            assert!(api.set_transaction_name("/users/:id"));
        });
        let payload = api.agent().drain();
        assert!(payload.metrics.get("WebTransaction//users/:id", None).is_some());
    }

    #[test]
    fn test_record_custom_event_validation() {
        let api = api();
        assert!(!api.record_custom_event("bad-type!", Map::new()));
        assert!(api.record_custom_event(
            "Checkout",
            attributes(json!({"total": 12.5, "items": [1, 2], "user": "u1"}))
        ));

        let payload = api.agent().drain();
        assert_eq!(payload.custom_events.len(), 1);
        let event = &payload.custom_events[0];
        assert_eq!(event.attribute("total"), Some(&json!(12.5)));
        assert_eq!(event.attribute("items"), None);
    }

    #[test]
    fn test_notice_error_inside_and_outside_transaction() {
        let api = api();
        let error = CallError::new("TypeError", "boom");

        assert!(api.notice_error(&error, Map::new()));
        api.start_web_transaction("/fail", || {
            assert!(api.notice_error(&error, attributes(json!({"retry": false}))));
            assert!(api.add_custom_attribute("user", "u1"));
        });

        let payload = api.agent().drain();
        assert_eq!(payload.error_events.len(), 2);
        assert_eq!(payload.error_events[0].transaction_id, None);
        assert!(payload.error_events[1].transaction_id.is_some());
        assert_eq!(payload.error_events[1].error_class, "TypeError");
    }

    #[test]
    fn test_custom_attributes_outside_transaction_rejected() {
        let api = api();
        assert!(!api.add_custom_attribute("key", 1));
        assert_eq!(api.add_custom_attributes(attributes(json!({"a": 1}))), 0);
        assert!(!api.end_transaction());
    }
}
