// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process coordination service.
//!
//! [`MemoryCoordination`] plays the part of the external coordination
//! deployment: it hands out sessions, tracks ephemeral entries, and lets a
//! caller disconnect or expire a session to simulate the corresponding
//! failures. Single-node deployments run against it directly; the test suite
//! uses it to exercise leadership exclusivity and handoff.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;

use crate::{CoordError, CoordinationService, SessionEvent};

#[derive(Debug)]
struct Entry {
    payload: Vec<u8>,
    session: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    watchers: BTreeMap<String, Vec<oneshot::Sender<()>>>,
    next_session: u64,
}

impl State {
    fn remove_entry(&mut self, path: &str) {
        if self.entries.remove(path).is_some() {
            for tx in self.watchers.remove(path).unwrap_or_default() {
                let _ = tx.send(());
            }
        }
    }

    fn end_session(&mut self, session: u64) {
        let owned: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.session == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_entry(&path);
        }
    }
}

/// An in-process stand-in for the external coordination service.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordination {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordination {
    /// Creates a new, empty coordination service.
    pub fn new() -> MemoryCoordination {
        MemoryCoordination::default()
    }

    /// Opens a new session.
    pub fn session(&self) -> MemorySession {
        let id = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.next_session += 1;
            state.next_session
        };
        let (events, _) = broadcast::channel(16);
        MemorySession {
            id,
            state: Arc::clone(&self.state),
            events,
        }
    }

    /// Expires a session: its ephemeral entries vanish and the session
    /// observes [`SessionEvent::Expired`].
    pub fn expire(&self, session: &MemorySession) {
        self.state
            .lock()
            .expect("lock poisoned")
            .end_session(session.id);
        let _ = session.events.send(SessionEvent::Expired);
    }

    /// Severs the connection of a session without ending it.
    pub fn disconnect(&self, session: &MemorySession) {
        let _ = session.events.send(SessionEvent::Disconnected);
    }

    /// Restores the connection of a disconnected session.
    pub fn reconnect(&self, session: &MemorySession) {
        let _ = session.events.send(SessionEvent::Reconnected);
    }

    /// Returns the payload of the entry at `path`, if one exists.
    pub fn payload(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("lock poisoned")
            .entries
            .get(path)
            .map(|e| e.payload.clone())
    }
}

/// One session with a [`MemoryCoordination`] service.
#[derive(Debug, Clone)]
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl CoordinationService for MemorySession {
    async fn create_ephemeral(&self, path: &str, payload: &[u8]) -> Result<(), CoordError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.entries.contains_key(path) {
            return Err(CoordError::AlreadyExists);
        }
        state.entries.insert(
            path.to_string(),
            Entry {
                payload: payload.to_vec(),
                session: self.id,
            },
        );
        Ok(())
    }

    async fn await_removed(&self, path: &str) -> Result<(), CoordError> {
        let rx = {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.entries.contains_key(path) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.watchers.entry(path.to_string()).or_default().push(tx);
            rx
        };
        // An error here means the watched entry outlived the service, which
        // cannot happen while we hold a handle to its state.
        let _ = rx.await;
        Ok(())
    }

    fn session_events(&self) -> BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    async fn close(&self) {
        self.state
            .lock()
            .expect("lock poisoned")
            .end_session(self.id);
        let _ = self.events.send(SessionEvent::Expired);
    }
}
