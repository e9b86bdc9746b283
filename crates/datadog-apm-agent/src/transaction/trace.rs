// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Arena storage for the segment tree of one transaction.
//!
//! Segments are addressed by [`SegmentId`]. A node points at its parent by index and keeps its
//! children in creation order. Times are offsets from the trace start so a closed interval is
//! never negative.

use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde_json::{Map, Value};

use super::segment::OnEnd;
use super::new_span_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId(pub(crate) usize);

impl SegmentId {
    pub const ROOT: SegmentId = SegmentId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

pub(crate) struct SegmentNode {
    pub(crate) name: String,
    pub(crate) span_id: String,
    pub(crate) parent: Option<SegmentId>,
    pub(crate) children: Vec<SegmentId>,
    pub(crate) start: Duration,
    pub(crate) end: Option<Duration>,
    pub(crate) attributes: Map<String, Value>,
    pub(crate) incomplete: bool,
    pub(crate) on_end: Vec<OnEnd>,
}

impl SegmentNode {
    fn new(name: &str, parent: Option<SegmentId>, start: Duration) -> Self {
        Self {
            name: name.to_string(),
            span_id: new_span_id(),
            parent,
            children: Vec::new(),
            start,
            end: None,
            attributes: Map::new(),
            incomplete: false,
            on_end: Vec::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub(crate) fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

/// Immutable copy of a closed segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedSegment {
    pub id: SegmentId,
    pub parent: Option<SegmentId>,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_offset: Duration,
    pub duration: Duration,
    pub attributes: Map<String, Value>,
    pub incomplete: bool,
}

pub(crate) struct Trace {
    started_at: Instant,
    start_time: SystemTime,
    nodes: Vec<SegmentNode>,
}

impl Trace {
    pub(crate) fn new(root_name: &str) -> Self {
        Self {
            started_at: Instant::now(),
            start_time: SystemTime::now(),
            nodes: vec![SegmentNode::new(root_name, None, Duration::ZERO)],
        }
    }

    pub(crate) fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node(&self, id: SegmentId) -> Option<&SegmentNode> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node_mut(&mut self, id: SegmentId) -> Option<&mut SegmentNode> {
        self.nodes.get_mut(id.0)
    }

    /// Adds a child under `parent`, which falls back to the root when unknown.
    pub(crate) fn add(&mut self, parent: SegmentId, name: &str, at: Duration) -> SegmentId {
        let parent = if parent.0 < self.nodes.len() {
            parent
        } else {
            SegmentId::ROOT
        };
        let id = SegmentId(self.nodes.len());
        self.nodes.push(SegmentNode::new(name, Some(parent), at));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Closes `id` at `at`. Descendants still open are flagged incomplete; they keep running
    /// until they end on their own or the transaction force-closes them.
    ///
    /// Returns the callbacks registered on the segment, or `None` if it was already closed.
    pub(crate) fn end(&mut self, id: SegmentId, at: Duration) -> Option<Vec<OnEnd>> {
        let node = self.nodes.get_mut(id.0)?;
        if !node.is_open() {
            return None;
        }
        node.end = Some(at.max(node.start));
        let callbacks = std::mem::take(&mut node.on_end);

        for descendant in self.descendants(id) {
            if self.nodes[descendant.0].is_open() {
                self.nodes[descendant.0].incomplete = true;
            }
        }
        Some(callbacks)
    }

    /// Closes every open segment at `at`, marking all but the root incomplete.
    pub(crate) fn close_all(&mut self, at: Duration) -> Vec<(SegmentId, Vec<OnEnd>)> {
        let mut closed = Vec::new();
        // Children first so their callbacks run before their parents'.
        for index in (0..self.nodes.len()).rev() {
            let node = &mut self.nodes[index];
            if !node.is_open() {
                continue;
            }
            node.end = Some(at.max(node.start));
            if index != SegmentId::ROOT.0 {
                node.incomplete = true;
            }
            closed.push((SegmentId(index), std::mem::take(&mut node.on_end)));
        }
        closed
    }

    /// Pre-order walk below `id`, excluding `id` itself.
    pub(crate) fn descendants(&self, id: SegmentId) -> Vec<SegmentId> {
        let mut found = Vec::new();
        let mut stack: Vec<SegmentId> = match self.nodes.get(id.0) {
            Some(node) => node.children.iter().rev().copied().collect(),
            None => return found,
        };
        while let Some(next) = stack.pop() {
            found.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        found
    }

    pub(crate) fn is_descendant_of(&self, id: SegmentId, ancestor: SegmentId) -> bool {
        let mut current = self.nodes.get(id.0).and_then(|node| node.parent);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes[parent.0].parent;
        }
        false
    }

    /// Snapshot of every segment in pre-order starting at the root. Open segments are
    /// reported with the duration they have so far.
    pub(crate) fn finish(&self, now: Duration) -> Vec<FinishedSegment> {
        std::iter::once(SegmentId::ROOT)
            .chain(self.descendants(SegmentId::ROOT))
            .map(|id| {
                let node = &self.nodes[id.0];
                FinishedSegment {
                    id,
                    parent: node.parent,
                    span_id: node.span_id.clone(),
                    parent_span_id: node.parent.map(|parent| self.nodes[parent.0].span_id.clone()),
                    name: node.name.clone(),
                    start_offset: node.start,
                    duration: node
                        .duration()
                        .unwrap_or_else(|| now.saturating_sub(node.start)),
                    attributes: node.attributes.clone(),
                    incomplete: node.incomplete,
                }
            })
            .collect()
    }
}
