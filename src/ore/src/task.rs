// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task spawning with mandatory names.
//!
//! Unnamed tasks are invisible in diagnostics, so this module makes the name
//! part of the spawn signature. The name is computed lazily because building
//! it can itself allocate and most runtimes discard it.

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns a named task onto the current tokio runtime.
///
/// The name is attached to the task when the runtime supports it (requires
/// `--cfg tokio_unstable`); otherwise it is dropped.
#[track_caller]
pub fn spawn<N, NC, Fut>(nc: NC, future: Fut) -> JoinHandle<Fut::Output>
where
    N: AsRef<str>,
    NC: FnOnce() -> N,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(nc().as_ref())
            .spawn(future)
            .expect("spawn on active runtime cannot fail")
    }
    #[cfg(not(tokio_unstable))]
    {
        let _ = nc;
        tokio::spawn(future)
    }
}

/// Spawns a named blocking task onto the current tokio runtime.
#[track_caller]
pub fn spawn_blocking<N, NC, F, R>(nc: NC, function: F) -> JoinHandle<R>
where
    N: AsRef<str>,
    NC: FnOnce() -> N,
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(nc().as_ref())
            .spawn_blocking(function)
            .expect("spawn on active runtime cannot fail")
    }
    #[cfg(not(tokio_unstable))]
    {
        let _ = nc;
        tokio::task::spawn_blocking(function)
    }
}
