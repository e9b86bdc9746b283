// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transactions and the segment tree they own.
//!
//! A transaction moves through `Active -> Ending -> Ended` exactly once. While `Active` it
//! accepts new segments. `Ending` is the window in which segment `on_end` callbacks run: they
//! may still record exceptions and queue events, but no new segment is accepted. Once `Ended`
//! the finished snapshot is handed to the agent's aggregators and the transaction is inert.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::aggregators::AggregatedEvent;
use crate::names;

pub mod exception;
pub mod segment;
pub mod trace;

pub use exception::Exception;
pub use segment::{OnEnd, Segment};
pub use trace::{FinishedSegment, SegmentId};

use trace::Trace;

pub const MAX_CUSTOM_ATTRIBUTES: usize = 64;
pub const MAX_ATTRIBUTE_KEY_LENGTH: usize = 255;

pub(crate) fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

pub(crate) fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub(crate) fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Web,
    Background,
}

impl TransactionKind {
    pub fn metric_prefix(self) -> &'static str {
        match self {
            TransactionKind::Web => names::WEB_TRANSACTION,
            TransactionKind::Background => names::OTHER_TRANSACTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Ending,
    Ended,
}

struct TransactionState {
    name: String,
    status: TransactionStatus,
    trace: Trace,
    exceptions: Vec<Exception>,
    custom_attributes: Map<String, Value>,
    agent_attributes: Map<String, Value>,
    events: Vec<AggregatedEvent>,
}

pub struct Transaction {
    id: String,
    trace_id: String,
    kind: TransactionKind,
    agent: Weak<Agent>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub(crate) fn new(agent: Weak<Agent>, kind: TransactionKind, name: &str) -> Arc<Self> {
        let transaction = Arc::new(Self {
            id: new_span_id(),
            trace_id: new_trace_id(),
            kind,
            agent,
            state: Mutex::new(TransactionState {
                name: name.to_string(),
                status: TransactionStatus::Active,
                trace: Trace::new(name),
                exceptions: Vec::new(),
                custom_attributes: Map::new(),
                agent_attributes: Map::new(),
                events: Vec::new(),
            }),
        });
        debug!(
            "Started {:?} transaction {} ({})",
            kind, transaction.id, name
        );
        transaction
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.lock().name = name.to_string();
    }

    pub fn metric_name(&self) -> String {
        format!("{}/{}", self.kind.metric_prefix(), self.lock().name)
    }

    pub fn status(&self) -> TransactionStatus {
        self.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    pub fn root_id(&self) -> SegmentId {
        SegmentId::ROOT
    }

    pub fn root(self: &Arc<Self>) -> Segment {
        Segment::new(Arc::clone(self), SegmentId::ROOT)
    }

    pub fn segment(self: &Arc<Self>, id: SegmentId) -> Option<Segment> {
        let exists = self.with_trace(|trace| trace.node(id).is_some());
        exists.then(|| Segment::new(Arc::clone(self), id))
    }

    pub fn segment_count(&self) -> usize {
        self.with_trace(Trace::len)
    }

    /// Opens a segment under `parent` (the root when `None`). Rejected with `None` once the
    /// transaction is no longer active.
    pub fn create_segment(self: &Arc<Self>, parent: Option<SegmentId>, name: &str) -> Option<Segment> {
        let id = {
            let mut state = self.lock();
            if state.status != TransactionStatus::Active {
                warn!(
                    "Not creating segment {} on {:?} transaction {}",
                    name, state.status, self.id
                );
                return None;
            }
            let at = state.trace.elapsed();
            state
                .trace
                .add(parent.unwrap_or(SegmentId::ROOT), name, at)
        };
        Some(Segment::new(Arc::clone(self), id))
    }

    pub(crate) fn end_segment(self: &Arc<Self>, id: SegmentId) -> bool {
        let callbacks = {
            let mut state = self.lock();
            let at = state.trace.elapsed();
            state.trace.end(id, at)
        };
        let Some(callbacks) = callbacks else {
            return false;
        };
        let segment = Segment::new(Arc::clone(self), id);
        for callback in callbacks {
            callback(&segment);
        }
        true
    }

    /// Ends the transaction. Returns `true` only for the call that actually ended it.
    pub fn end(self: &Arc<Self>) -> bool {
        let closed = {
            let mut state = self.lock();
            if state.status != TransactionStatus::Active {
                return false;
            }
            state.status = TransactionStatus::Ending;
            let at = state.trace.elapsed();
            state.trace.close_all(at)
        };

        for (id, callbacks) in closed {
            let segment = Segment::new(Arc::clone(self), id);
            for callback in callbacks {
                callback(&segment);
            }
        }

        let finished = {
            let mut state = self.lock();
            state.status = TransactionStatus::Ended;
            let duration = state
                .trace
                .node(SegmentId::ROOT)
                .and_then(|root| root.duration())
                .unwrap_or_default();
            FinishedTransaction {
                id: self.id.clone(),
                trace_id: self.trace_id.clone(),
                kind: self.kind,
                name: state.name.clone(),
                start_time: state.trace.start_time(),
                duration,
                segments: state.trace.finish(duration),
                exceptions: std::mem::take(&mut state.exceptions),
                custom_attributes: state.custom_attributes.clone(),
                agent_attributes: state.agent_attributes.clone(),
                events: std::mem::take(&mut state.events),
            }
        };

        debug!(
            "Ended transaction {} ({}) with {} segments",
            finished.id,
            finished.name,
            finished.segments.len()
        );
        if let Some(agent) = self.agent.upgrade() {
            agent.record_finished(finished);
        }
        true
    }

    /// Appends an exception. Every recorded exception is kept, in order, until the
    /// transaction ends.
    pub fn record_exception(&self, exception: Exception) -> bool {
        let mut state = self.lock();
        if state.status == TransactionStatus::Ended {
            warn!(
                "Dropping exception {} recorded after transaction {} ended",
                exception.error, self.id
            );
            return false;
        }
        state.exceptions.push(exception);
        true
    }

    pub fn exceptions(&self) -> Vec<Exception> {
        self.lock().exceptions.clone()
    }

    pub fn add_custom_attribute(&self, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        if key.is_empty() || key.len() > MAX_ATTRIBUTE_KEY_LENGTH {
            warn!("Custom attribute key length must be 1-{MAX_ATTRIBUTE_KEY_LENGTH}, got {key:?}");
            return false;
        }
        if !is_primitive(&value) {
            warn!("Custom attribute {key} must be a string, number or boolean");
            return false;
        }
        let mut state = self.lock();
        if state.status == TransactionStatus::Ended {
            return false;
        }
        if !state.custom_attributes.contains_key(key)
            && state.custom_attributes.len() >= MAX_CUSTOM_ATTRIBUTES
        {
            warn!("Maximum number of custom attributes reached, dropping {key}");
            return false;
        }
        state.custom_attributes.insert(key.to_string(), value);
        true
    }

    pub fn custom_attribute(&self, key: &str) -> Option<Value> {
        self.lock().custom_attributes.get(key).cloned()
    }

    pub fn custom_attributes(&self) -> Map<String, Value> {
        self.lock().custom_attributes.clone()
    }

    pub fn add_agent_attribute(&self, key: &str, value: impl Into<Value>) {
        self.lock()
            .agent_attributes
            .insert(key.to_string(), value.into());
    }

    pub fn agent_attributes(&self) -> Map<String, Value> {
        self.lock().agent_attributes.clone()
    }

    /// Queues an event to be handed to the aggregators when the transaction ends.
    pub fn queue_event(&self, event: AggregatedEvent) -> bool {
        let mut state = self.lock();
        if state.status == TransactionStatus::Ended {
            warn!("Dropping event queued after transaction {} ended", self.id);
            return false;
        }
        state.events.push(event);
        true
    }

    pub fn pending_events(&self) -> Vec<AggregatedEvent> {
        self.lock().events.clone()
    }

    pub(crate) fn with_trace<R>(&self, f: impl FnOnce(&Trace) -> R) -> R {
        f(&self.lock().trace)
    }

    pub(crate) fn with_trace_mut<R>(&self, f: impl FnOnce(&mut Trace) -> R) -> R {
        f(&mut self.lock().trace)
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Immutable snapshot of an ended transaction.
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    pub id: String,
    pub trace_id: String,
    pub kind: TransactionKind,
    pub name: String,
    pub start_time: SystemTime,
    pub duration: Duration,
    /// Pre-order, root first.
    pub segments: Vec<FinishedSegment>,
    pub exceptions: Vec<Exception>,
    pub custom_attributes: Map<String, Value>,
    pub agent_attributes: Map<String, Value>,
    pub events: Vec<AggregatedEvent>,
}

impl FinishedTransaction {
    pub fn metric_name(&self) -> String {
        format!("{}/{}", self.kind.metric_prefix(), self.name)
    }

    pub fn root(&self) -> Option<&FinishedSegment> {
        self.segments.first()
    }
}
