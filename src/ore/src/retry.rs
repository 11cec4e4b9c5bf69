// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! This module provides a bounded exponential-backoff retry facility in two
//! shapes: [`Retry::retry_async`], which drives a fallible operation to
//! completion, and [`Retry::into_retry_stream`], which hands control of the
//! loop to the caller and only schedules the sleeps.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use pin_project::pin_project;
use tokio::time::{self, Sleep};

/// Configures a retry operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retry {
    /// The backoff to apply after the first failure.
    pub initial_backoff: Duration,
    /// The multiplier applied to the backoff after each failure.
    pub factor: f64,
    /// The maximum backoff between retries, regardless of `factor`.
    pub clamp_backoff: Duration,
    /// The maximum number of tries, including the first.
    pub max_tries: usize,
}

/// The state of a retry operation constructed with [`Retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct RetryState {
    /// The retry counter, zero for the first try.
    pub i: usize,
    /// The backoff that will be applied before the next try, or `None` if
    /// this is the last try.
    pub next_backoff: Option<Duration>,
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with backoff
    /// defaults that are reasonable for a fallible network operation.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: usize::MAX,
        }
    }
}

impl Retry {
    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the maximum backoff.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the exponential backoff factor.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the maximum number of tries.
    ///
    /// # Panics
    ///
    /// Panics if `max_tries` is zero.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        assert!(max_tries > 0, "max tries must be greater than zero");
        self.max_tries = max_tries;
        self
    }

    /// Retries the asynchronous, fallible operation `f` according to the
    /// configured policy.
    ///
    /// The operation resolves to `Ok` on the first success, or to the error
    /// produced by the final try once the policy is exhausted.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let stream = self.into_retry_stream();
        tokio::pin!(stream);
        let mut err = None;
        while let Some(state) = stream.next().await {
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) => err = Some(e),
            }
        }
        Err(err.expect("retry stream produces at least one state"))
    }

    /// Converts the retry configuration into a [`RetryStream`].
    pub fn into_retry_stream(self) -> RetryStream {
        RetryStream {
            retry: self,
            start: false,
            i: 0,
            next_backoff: None,
            sleep: time::sleep(Duration::ZERO),
        }
    }
}

/// A stream whose items are yielded according to a [`Retry`] policy.
///
/// The first item is available immediately; each subsequent item becomes
/// available only after the appropriate backoff has elapsed. The stream ends
/// after `max_tries` items. Consume it with [`StreamExt::next`].
#[pin_project]
#[derive(Debug)]
pub struct RetryStream {
    retry: Retry,
    start: bool,
    i: usize,
    next_backoff: Option<Duration>,
    #[pin]
    sleep: Sleep,
}

impl RetryStream {
    fn poll_next_inner(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RetryState>> {
        let mut this = self.project();
        let retry = *this.retry;

        if *this.i >= retry.max_tries {
            return Poll::Ready(None);
        }
        if *this.start {
            match this.sleep.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {}
            }
        }
        *this.start = true;

        let backoff = match *this.next_backoff {
            None => retry.initial_backoff,
            Some(b) => Duration::from_secs_f64(b.as_secs_f64() * retry.factor),
        };
        let backoff = backoff.min(retry.clamp_backoff);
        *this.next_backoff = Some(backoff);

        let state = RetryState {
            i: *this.i,
            next_backoff: if *this.i + 1 < retry.max_tries {
                Some(backoff)
            } else {
                None
            },
        };
        *this.i += 1;
        this.sleep.as_mut().reset(time::Instant::now() + backoff);
        Poll::Ready(Some(state))
    }
}

impl Stream for RetryStream {
    type Item = RetryState;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_next_inner(cx)
    }
}
