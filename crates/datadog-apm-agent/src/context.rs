// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The implicit active context.
//!
//! Each thread owns a single current slot holding the active {transaction, segment} pair.
//! Synchronous code enters a context with [`enter`], which returns a guard restoring the
//! previous value on drop. Asynchronous code carries its context in a [`Contextual`] future,
//! which installs the captured context for the duration of every poll, so interleaved flows
//! on the same worker never observe each other.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use crate::transaction::{Segment, SegmentId, Transaction};

thread_local! {
    static CURRENT: RefCell<Context> = RefCell::new(Context::default());
}

#[derive(Clone, Default)]
pub struct Context {
    transaction: Option<Arc<Transaction>>,
    segment: Option<SegmentId>,
}

impl Context {
    pub fn new(transaction: Arc<Transaction>, segment: SegmentId) -> Self {
        Self {
            transaction: Some(transaction),
            segment: Some(segment),
        }
    }

    /// Context positioned at the transaction's root segment.
    pub fn for_transaction(transaction: &Arc<Transaction>) -> Self {
        Self::new(Arc::clone(transaction), transaction.root_id())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transaction.is_none()
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    pub fn segment_id(&self) -> Option<SegmentId> {
        self.segment
    }

    pub fn segment(&self) -> Option<Segment> {
        let transaction = self.transaction.as_ref()?;
        Some(Segment::new(Arc::clone(transaction), self.segment?))
    }

    /// Opens a child of this context's segment. `None` outside a transaction or once the
    /// transaction stopped accepting segments.
    pub fn create_segment(&self, name: &str) -> Option<Segment> {
        let transaction = self.transaction.as_ref()?;
        transaction.create_segment(self.segment, name)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .field("segment", &self.segment)
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        let same_transaction = match (&self.transaction, &other.transaction) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_transaction && self.segment == other.segment
    }
}

pub fn current() -> Context {
    CURRENT
        .try_with(|slot| slot.borrow().clone())
        .unwrap_or_default()
}

/// Replaces the current context, returning the previous one.
pub fn set_current(context: Context) -> Context {
    CURRENT
        .try_with(|slot| slot.replace(context))
        .unwrap_or_default()
}

pub fn current_transaction() -> Option<Arc<Transaction>> {
    CURRENT
        .try_with(|slot| slot.borrow().transaction.clone())
        .ok()
        .flatten()
}

pub fn current_segment() -> Option<Segment> {
    current().segment()
}

/// Restores the context that was current before [`enter`] when dropped.
///
/// The guard is tied to the thread that created it.
#[must_use = "dropping the guard immediately restores the previous context"]
pub struct ContextGuard {
    previous: Option<Context>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            set_current(previous);
        }
    }
}

pub fn enter(context: Context) -> ContextGuard {
    ContextGuard {
        previous: Some(set_current(context)),
        _not_send: PhantomData,
    }
}

pub fn run_in_context<R>(context: Context, f: impl FnOnce() -> R) -> R {
    let _guard = enter(context);
    f()
}

/// Captures the current context now and restores it when the returned closure runs.
pub fn bind_fn<F, R>(f: F) -> impl FnOnce() -> R
where
    F: FnOnce() -> R,
{
    let captured = current();
    move || run_in_context(captured, f)
}

/// A future that runs every poll inside its own context.
///
/// Changes the future makes with [`set_current`] persist across its polls but never leak to
/// the executor thread.
pub struct Contextual<F> {
    context: Context,
    inner: Pin<Box<F>>,
}

impl<F> Contextual<F> {
    pub fn new(inner: F, context: Context) -> Self {
        Self {
            context,
            inner: Box::pin(inner),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl<F: Future> Future for Contextual<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let guard = enter(this.context.clone());
        let poll = this.inner.as_mut().poll(cx);
        this.context = current();
        drop(guard);
        poll
    }
}

pub trait ContextFutureExt: Future + Sized {
    fn in_context(self, context: Context) -> Contextual<Self> {
        Contextual::new(self, context)
    }

    fn in_current_context(self) -> Contextual<Self> {
        Contextual::new(self, current())
    }
}

impl<F: Future> ContextFutureExt for F {}
