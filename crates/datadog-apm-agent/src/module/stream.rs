// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental results of a streaming call.

use std::fmt;
use std::mem;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::module::CallResult;

type EndHook = Box<dyn FnOnce(&StreamSummary) + Send + 'static>;

/// What a stream produced before it ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub chunks: Vec<Value>,
    /// Set when the stream failed rather than running to completion.
    pub error: Option<CallError>,
}

/// A stream of chunks fed through a channel. It ends when every sender is gone or after the
/// first `Err` item; end hooks also run when the consumer drops it early.
pub struct ChunkStream {
    receiver: mpsc::Receiver<CallResult>,
    chunks: Vec<Value>,
    on_end: Vec<EndHook>,
    ended: bool,
}

impl ChunkStream {
    pub fn channel(capacity: usize) -> (mpsc::Sender<CallResult>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self::new(receiver))
    }

    /// A stream that yields `items` in order and then ends.
    pub fn from_items(items: Vec<CallResult>) -> Self {
        let (sender, stream) = Self::channel(items.len());
        for item in items {
            if sender.try_send(item).is_err() {
                break;
            }
        }
        stream
    }

    fn new(receiver: mpsc::Receiver<CallResult>) -> Self {
        Self {
            receiver,
            chunks: Vec::new(),
            on_end: Vec::new(),
            ended: false,
        }
    }

    /// Runs `hook` with every chunk seen once the stream ends, fails or is dropped.
    #[must_use]
    pub fn on_end(mut self, hook: impl FnOnce(&StreamSummary) + Send + 'static) -> Self {
        self.on_end.push(Box::new(hook));
        self
    }

    pub async fn next(&mut self) -> Option<CallResult> {
        if self.ended {
            return None;
        }
        let item = self.receiver.recv().await;
        match &item {
            Some(Ok(chunk)) => {
                if !self.on_end.is_empty() {
                    self.chunks.push(chunk.clone());
                }
            }
            Some(Err(error)) => self.end(Some(error.clone())),
            None => self.end(None),
        }
        item
    }

    /// Reads the stream to its end.
    pub async fn collect(mut self) -> Result<Vec<Value>, CallError> {
        let mut chunks = Vec::new();
        while let Some(item) = self.next().await {
            chunks.push(item?);
        }
        Ok(chunks)
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn end(&mut self, error: Option<CallError>) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.receiver.close();
        let summary = StreamSummary {
            chunks: mem::take(&mut self.chunks),
            error,
        };
        for hook in self.on_end.drain(..) {
            hook(&summary);
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.end(None);
    }
}

impl fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStream")
            .field("buffered", &self.chunks.len())
            .field("ended", &self.ended)
            .finish()
    }
}
