// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Leader election over a ZooKeeper-style coordination service.
//!
//! Leadership is expressed as an ephemeral entry at a well-known path whose
//! payload is the controller's own address. The [`CoordinationService`] trait
//! captures the small slice of the coordination service the controller needs:
//! ephemeral creation, removal watches, and session liveness events. The
//! production binding is an external deployment; [`MemoryCoordination`]
//! provides a complete in-process implementation for tests and single-node
//! deployments.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;

mod election;
mod memory;

pub use election::{LeaderElection, LeaderState, LeadershipHandle};
pub use memory::{MemoryCoordination, MemorySession};

/// The well-known path of the leader entry.
pub const DEFAULT_LEADER_PATH: &str = "/director/leader";

/// The default coordination session timeout.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 2000;

/// An error produced by a [`CoordinationService`].
#[derive(Debug)]
pub enum CoordError {
    /// The entry already exists.
    AlreadyExists,
    /// The session backing this handle has ended and cannot be revived.
    SessionEnded,
    /// A transient service error; the operation may be retried.
    Transient(anyhow::Error),
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoordError::AlreadyExists => f.write_str("entry already exists"),
            CoordError::SessionEnded => f.write_str("coordination session ended"),
            CoordError::Transient(e) => write!(f, "transient coordination error: {e:#}"),
        }
    }
}

impl std::error::Error for CoordError {}

/// An event describing the liveness of a coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The connection to the service was lost. Ephemeral entries survive
    /// until the session times out.
    Disconnected,
    /// The connection to the service was reestablished before the session
    /// timed out.
    Reconnected,
    /// The session timed out. All ephemeral entries it created are gone.
    Expired,
}

/// A handle to one session with the coordination service.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Creates an ephemeral entry at `path` with the given payload.
    ///
    /// The entry lives exactly as long as this session. Returns
    /// [`CoordError::AlreadyExists`] if any session currently holds the
    /// entry.
    async fn create_ephemeral(&self, path: &str, payload: &[u8]) -> Result<(), CoordError>;

    /// Resolves once no entry exists at `path`.
    ///
    /// Resolves immediately if the entry is already absent.
    async fn await_removed(&self, path: &str) -> Result<(), CoordError>;

    /// Returns the stream of liveness events for this session.
    ///
    /// The stream ends when the session does.
    fn session_events(&self) -> BoxStream<'static, SessionEvent>;

    /// Ends the session, removing every ephemeral entry it created.
    async fn close(&self);
}
