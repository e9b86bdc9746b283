// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use super::trace::SegmentId;
use super::Transaction;
use crate::context::Context;

/// Side effect run once a segment closes, outside the transaction lock.
pub type OnEnd = Box<dyn FnOnce(&Segment) + Send + 'static>;

/// Handle to one segment of a transaction's tree.
///
/// The segment belongs to the transaction it was created in for its whole life.
#[derive(Clone)]
pub struct Segment {
    transaction: Arc<Transaction>,
    id: SegmentId,
}

impl Segment {
    pub(crate) fn new(transaction: Arc<Transaction>, id: SegmentId) -> Self {
        Self { transaction, id }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    /// Context with this segment as the active one.
    pub fn context(&self) -> Context {
        Context::new(Arc::clone(&self.transaction), self.id)
    }

    pub fn name(&self) -> String {
        self.transaction
            .with_trace(|trace| trace.node(self.id).map(|node| node.name.clone()))
            .unwrap_or_default()
    }

    pub fn span_id(&self) -> String {
        self.transaction
            .with_trace(|trace| trace.node(self.id).map(|node| node.span_id.clone()))
            .unwrap_or_default()
    }

    pub fn parent(&self) -> Option<Segment> {
        let parent = self
            .transaction
            .with_trace(|trace| trace.node(self.id).and_then(|node| node.parent))?;
        Some(Segment::new(Arc::clone(&self.transaction), parent))
    }

    pub fn children(&self) -> Vec<Segment> {
        self.transaction
            .with_trace(|trace| {
                trace
                    .node(self.id)
                    .map(|node| node.children.clone())
                    .unwrap_or_default()
            })
            .into_iter()
            .map(|id| Segment::new(Arc::clone(&self.transaction), id))
            .collect()
    }

    pub fn create_child(&self, name: &str) -> Option<Segment> {
        self.transaction.create_segment(Some(self.id), name)
    }

    pub fn add_attribute(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        self.transaction.with_trace_mut(|trace| {
            if let Some(node) = trace.node_mut(self.id) {
                node.attributes.insert(key.to_string(), value);
            }
        });
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.transaction.with_trace(|trace| {
            trace
                .node(self.id)
                .and_then(|node| node.attributes.get(key).cloned())
        })
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.transaction.with_trace(|trace| {
            trace
                .node(self.id)
                .map(|node| node.attributes.clone())
                .unwrap_or_default()
        })
    }

    /// Registers `callback` to run when the segment closes. Returns `false` when the segment
    /// is already closed, in which case the callback is dropped.
    pub fn on_end(&self, callback: impl FnOnce(&Segment) + Send + 'static) -> bool {
        self.transaction.with_trace_mut(|trace| match trace.node_mut(self.id) {
            Some(node) if node.is_open() => {
                node.on_end.push(Box::new(callback));
                true
            }
            _ => false,
        })
    }

    /// Closes the segment. Only the first call has an effect.
    pub fn end(&self) -> bool {
        self.transaction.end_segment(self.id)
    }

    pub fn is_open(&self) -> bool {
        self.transaction.with_trace(|trace| {
            trace
                .node(self.id)
                .map(|node| node.is_open())
                .unwrap_or(false)
        })
    }

    pub fn is_incomplete(&self) -> bool {
        self.transaction.with_trace(|trace| {
            trace
                .node(self.id)
                .map(|node| node.incomplete)
                .unwrap_or(false)
        })
    }

    pub fn duration(&self) -> Option<Duration> {
        self.transaction
            .with_trace(|trace| trace.node(self.id).and_then(|node| node.duration()))
    }

    /// Closed duration, or the time elapsed so far for an open segment.
    pub fn elapsed(&self) -> Duration {
        self.transaction.with_trace(|trace| {
            trace
                .node(self.id)
                .map(|node| {
                    node.duration()
                        .unwrap_or_else(|| trace.elapsed().saturating_sub(node.start))
                })
                .unwrap_or_default()
        })
    }

    pub fn is_descendant_of(&self, other: &Segment) -> bool {
        Arc::ptr_eq(&self.transaction, &other.transaction)
            && self
                .transaction
                .with_trace(|trace| trace.is_descendant_of(self.id, other.id))
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.transaction, &other.transaction) && self.id == other.id
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("transaction", &self.transaction.id())
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    #[test]
    fn test_on_end_runs_once_after_close() {
        let tx = Transaction::new(Weak::new(), TransactionKind::Background, "job");
        let segment = tx.root().create_child("work").expect("segment");
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        assert!(segment.on_end(move |closed| {
            assert!(!closed.is_open());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(segment.end());
        assert!(!segment.end());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!segment.on_end(|_| {}));
    }

    #[test]
    fn test_attributes_and_tree_navigation() {
        let tx = Transaction::new(Weak::new(), TransactionKind::Web, "/users");
        let root = tx.root();
        let db = root.create_child("Datastore/select").expect("db");
        db.add_attribute("rows", 3);

        assert_eq!(db.attribute("rows"), Some(Value::from(3)));
        assert_eq!(db.parent(), Some(root.clone()));
        assert_eq!(root.children(), vec![db.clone()]);
        assert!(db.is_descendant_of(&root));
        assert!(!root.is_descendant_of(&db));
        assert_eq!(db.span_id().len(), 16);
    }
}
