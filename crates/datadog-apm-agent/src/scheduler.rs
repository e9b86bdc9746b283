// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Context-preserving scheduling primitives.
//!
//! Every function here captures the current context when work is scheduled and restores it when
//! the work runs, so a continuation is attributed to the request that scheduled it. All of them
//! must be called from within a tokio runtime.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::context::{self, ContextFutureExt};
use crate::names;
use crate::transaction::Segment;

/// Handle to a pending timer.
#[derive(Debug)]
pub struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Cancels the timer. A callback that already started runs to completion.
    pub fn clear(&self) {
        self.token.cancel();
    }

    pub fn is_cleared(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits until the timer fired or observed its cancellation.
    pub async fn finished(self) {
        let _ = self.handle.await;
    }
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future.in_current_context())
}

pub fn spawn_blocking<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(context::bind_fn(f))
}

/// Runs `callback` once after `delay`.
///
/// Inside a transaction the wait is recorded as a `timers.setTimeout` segment; the callback runs
/// with that segment active and the segment closes once the callback returns or the timer is
/// cleared.
pub fn set_timeout<F>(delay: Duration, callback: F) -> Timer
where
    F: FnOnce() + Send + 'static,
{
    let caller = context::current();
    let segment = caller.create_segment(names::TIMERS_SET_TIMEOUT);
    let callback_context = segment.as_ref().map(Segment::context).unwrap_or(caller);

    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {
                trace!("Timer cleared before firing");
                if let Some(segment) = &segment {
                    segment.end();
                }
            }
            _ = tokio::time::sleep(delay) => {
                context::run_in_context(callback_context, callback);
                if let Some(segment) = &segment {
                    segment.end();
                }
            }
        }
    });

    Timer { token, handle }
}

/// Runs `callback` every `period`, first after one full period, until cleared.
pub fn set_interval<F>(period: Duration, mut callback: F) -> Timer
where
    F: FnMut() + Send + 'static,
{
    let captured = context::current();
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.tick().await; // discard first tick

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticks.tick() => {
                    context::run_in_context(captured.clone(), &mut callback);
                }
            }
        }
    });

    Timer { token, handle }
}

/// Runs `callback` on a later turn of the runtime, after already queued work.
pub fn set_immediate<F>(callback: F) -> Timer
where
    F: FnOnce() + Send + 'static,
{
    let captured = context::current();
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let handle = tokio::spawn(async move {
        tokio::task::yield_now().await;
        if !cancelled.is_cancelled() {
            context::run_in_context(captured, callback);
        }
    });

    Timer { token, handle }
}

/// Queues `callback` to run as soon as the runtime polls it.
pub fn next_tick<F>(callback: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    let callback = context::bind_fn(callback);
    tokio::spawn(async move { callback() })
}
