// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The leader-election state machine.
//!
//! A controller moves `Follower → Leader` by creating the ephemeral leader
//! entry, and `Leader → Lost` when its session falters. Loss is final for
//! the lifetime of the process: an ex-leader never campaigns again, it idles
//! until restarted. Observers follow the state through a
//! [`LeadershipHandle`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{info, warn};

use fleet_ore::retry::Retry;

use crate::{CoordError, CoordinationService, SessionEvent};

/// The leadership state of one controller process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Not the leader; contending for the entry.
    Follower,
    /// Holding the leader entry. Only this state may issue provider writes.
    Leader,
    /// Leadership (or the session backing it) is gone for good.
    Lost,
}

/// A live view of a [`LeaderElection`]'s state.
#[derive(Debug, Clone)]
pub struct LeadershipHandle {
    rx: watch::Receiver<LeaderState>,
}

impl LeadershipHandle {
    /// Returns the current state.
    pub fn state(&self) -> LeaderState {
        *self.rx.borrow()
    }

    /// Reports whether this process is currently the leader.
    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Reports whether leadership is permanently lost.
    pub fn is_lost(&self) -> bool {
        self.state() == LeaderState::Lost
    }

    /// Waits until this process becomes leader.
    ///
    /// Returns `false` if leadership was lost (or the election ended)
    /// without ever reaching the Leader state.
    pub async fn wait_leader(&mut self) -> bool {
        loop {
            match *self.rx.borrow() {
                LeaderState::Leader => return true,
                LeaderState::Lost => return false,
                LeaderState::Follower => {}
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Waits until leadership is lost.
    pub async fn lost(&mut self) {
        loop {
            if *self.rx.borrow() == LeaderState::Lost {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One contender in the leader election.
pub struct LeaderElection {
    service: Arc<dyn CoordinationService>,
    path: String,
    payload: Vec<u8>,
    tx: watch::Sender<LeaderState>,
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LeaderElection {
    /// Creates an election contender whose leader entry carries `payload`
    /// (the controller's own address).
    pub fn new(
        service: Arc<dyn CoordinationService>,
        path: &str,
        payload: Vec<u8>,
    ) -> (LeaderElection, LeadershipHandle) {
        let (tx, rx) = watch::channel(LeaderState::Follower);
        (
            LeaderElection {
                service,
                path: path.to_string(),
                payload,
                tx,
            },
            LeadershipHandle { rx },
        )
    }

    /// Runs the election to completion.
    ///
    /// Resolves only once leadership has been permanently lost; callers
    /// normally spawn this on a task and observe it through the handle.
    pub async fn run(self) {
        let service = Arc::clone(&self.service);
        let path = self.path.clone();
        let payload = self.payload.clone();
        let mut events = service.session_events();

        // Follower: contend for the entry until acquired or the session ends.
        let retry = Retry::default()
            .initial_backoff(Duration::from_millis(100))
            .clamp_backoff(Duration::from_secs(5))
            .into_retry_stream();
        tokio::pin!(retry);
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(SessionEvent::Reconnected) => {}
                    Some(SessionEvent::Disconnected) => {
                        // Cannot assume leadership while disconnected; wait
                        // for the session to come back or end.
                        if !await_reconnected(&mut events).await {
                            return self.lose();
                        }
                    }
                    Some(SessionEvent::Expired) | None => return self.lose(),
                },
                acquired = try_acquire(&*service, &path, &payload) => {
                    match acquired {
                        Ok(true) => break,
                        // The existing entry vanished; contend again at once.
                        Ok(false) => {}
                        Err(CoordError::SessionEnded) => return self.lose(),
                        Err(e) => {
                            warn!("leader acquisition at {path} failed, retrying: {e}");
                            retry.next().await;
                        }
                    }
                }
            }
        }

        info!("acquired leadership at {path}");
        self.tx.send_replace(LeaderState::Leader);

        // Leader: hold until the session falters. A disconnect is treated as
        // loss; we cannot know whether the entry survived the outage.
        loop {
            match events.next().await {
                Some(SessionEvent::Reconnected) => {}
                Some(SessionEvent::Disconnected)
                | Some(SessionEvent::Expired)
                | None => return self.lose(),
            }
        }
    }

    fn lose(self) {
        warn!("leadership at {} lost", self.path);
        self.tx.send_replace(LeaderState::Lost);
    }
}

async fn try_acquire(
    service: &dyn CoordinationService,
    path: &str,
    payload: &[u8],
) -> Result<bool, CoordError> {
    match service.create_ephemeral(path, payload).await {
        Ok(()) => Ok(true),
        Err(CoordError::AlreadyExists) => {
            service.await_removed(path).await?;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

async fn await_reconnected(events: &mut BoxStream<'static, SessionEvent>) -> bool {
    loop {
        match events.next().await {
            Some(SessionEvent::Reconnected) => return true,
            Some(SessionEvent::Disconnected) => {}
            Some(SessionEvent::Expired) | None => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{MemoryCoordination, MemorySession};

    use super::*;

    fn contender(
        coord: &MemoryCoordination,
        addr: &str,
    ) -> (MemorySession, LeadershipHandle) {
        let session = coord.session();
        let (election, handle) = LeaderElection::new(
            Arc::new(session.clone()),
            crate::DEFAULT_LEADER_PATH,
            addr.as_bytes().to_vec(),
        );
        tokio::spawn(election.run());
        (session, handle)
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within deadline");
    }

    #[tokio::test]
    async fn at_most_one_leader() {
        let coord = MemoryCoordination::new();
        let contenders: Vec<_> = (0..3)
            .map(|i| contender(&coord, &format!("10.0.0.{i}")))
            .collect();

        settle(|| contenders.iter().filter(|(_, h)| h.is_leader()).count() == 1).await;
        // Leadership stays exclusive while everyone is healthy.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(contenders.iter().filter(|(_, h)| h.is_leader()).count(), 1);
    }

    #[tokio::test]
    async fn handoff_after_session_expiry() {
        let coord = MemoryCoordination::new();
        let contenders: Vec<_> = (0..3)
            .map(|i| contender(&coord, &format!("10.0.0.{i}")))
            .collect();

        settle(|| contenders.iter().filter(|(_, h)| h.is_leader()).count() == 1).await;
        let leader = contenders
            .iter()
            .position(|(_, h)| h.is_leader())
            .expect("one leader");

        coord.expire(&contenders[leader].0);

        // Some follower takes over, and the ex-leader never comes back.
        settle(|| {
            contenders
                .iter()
                .enumerate()
                .filter(|(i, (_, h))| *i != leader && h.is_leader())
                .count()
                == 1
        })
        .await;
        assert!(contenders[leader].1.is_lost());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(contenders[leader].1.is_lost());
        assert_eq!(contenders.iter().filter(|(_, h)| h.is_leader()).count(), 1);
    }

    #[tokio::test]
    async fn disconnect_while_leader_is_loss() {
        let coord = MemoryCoordination::new();
        let (session, mut handle) = contender(&coord, "10.0.0.1");
        settle(|| handle.is_leader()).await;

        coord.disconnect(&session);
        handle.lost().await;
        assert!(handle.is_lost());
    }
}
