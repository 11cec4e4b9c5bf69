// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The top of the fleet controller: leader election wrapped around the node
//! manager.
//!
//! A [`Director`] owns the process-lifecycle resources — the coordination
//! session, the replicated registry, the election task — and runs the
//! control loop: wait for leadership, then run a monitor pass every
//! interval until leadership is lost or a shutdown is requested. Leadership
//! loss is final for the process; the director returns and the operator's
//! supervisor restarts it as a fresh follower.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use fleet_controller::{NodeManager, NodeManagerConfig, NodeRecord, PassError};
use fleet_coord::{CoordinationService, LeaderElection, LeadershipHandle};
use fleet_registry::Registry;

/// The default period between monitor passes.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// The default number of registry shards.
pub const DEFAULT_SHARD_COUNT: usize = 4;

/// Configures a [`Director`].
pub struct DirectorConfig {
    /// This controller's own address; the payload of the leader entry.
    pub address: String,
    /// The coordination service to elect through.
    pub coordination: Arc<dyn CoordinationService>,
    /// The well-known path of the leader entry.
    pub leader_path: String,
    /// The period between monitor passes.
    pub monitor_interval: Duration,
    /// How many registry shards to run.
    pub shard_count: usize,
    /// Where the registry persists across restarts, if anywhere.
    pub data_dir: Option<PathBuf>,
    /// Everything the node manager needs.
    pub manager: NodeManagerConfig,
}

/// The top-level lifecycle of one controller process.
pub struct Director {
    coordination: Arc<dyn CoordinationService>,
    registry: Arc<Registry<NodeRecord>>,
    leadership: LeadershipHandle,
    manager: NodeManager,
    monitor_interval: Duration,
    data_dir: Option<PathBuf>,
}

impl std::fmt::Debug for Director {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Director")
            .field("monitor_interval", &self.monitor_interval)
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Director {
    /// Starts the registry (restoring any persisted state), spawns the
    /// election task, and wires up the node manager.
    pub async fn initialize(config: DirectorConfig) -> Result<Director, anyhow::Error> {
        let registry = Arc::new(Registry::start(config.shard_count));
        if let Some(dir) = &config.data_dir {
            registry.restore(dir).await?;
        }

        let (election, leadership) = LeaderElection::new(
            Arc::clone(&config.coordination),
            &config.leader_path,
            config.address.clone().into_bytes(),
        );
        fleet_ore::task::spawn(|| "leader-election", election.run());

        let manager = NodeManager::new(Arc::clone(&registry), leadership.clone(), config.manager);
        info!("director initialized as {}", config.address);
        Ok(Director {
            coordination: config.coordination,
            registry,
            leadership,
            manager,
            monitor_interval: config.monitor_interval,
            data_dir: config.data_dir,
        })
    }

    /// The node manager, for registering seed hosts.
    pub fn manager(&self) -> &NodeManager {
        &self.manager
    }

    /// A live view of this controller's leadership.
    pub fn leadership(&self) -> LeadershipHandle {
        self.leadership.clone()
    }

    /// Runs the controller until leadership is lost or `shutdown` resolves.
    ///
    /// On shutdown the coordination session is closed (releasing leadership)
    /// and the registry is snapshotted. On leadership loss the loop stops
    /// eagerly and the director returns; it never campaigns again.
    pub async fn node_controller(
        &self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), anyhow::Error> {
        tokio::pin!(shutdown);

        let mut leadership = self.leadership.clone();
        tokio::select! {
            is_leader = leadership.wait_leader() => {
                if !is_leader {
                    warn!("leadership lost before it was ever held");
                    return Ok(());
                }
            }
            _ = &mut shutdown => return self.shutdown().await,
        }

        info!(
            "monitoring nodes every {:?} while leadership holds",
            self.monitor_interval
        );
        loop {
            // The pass re-checks leadership before every provider write, so
            // it is safe to let it run to completion here.
            match self.manager.monitor_pass().await {
                Ok(stats) => info!(
                    "monitor pass complete: {} hosts, {} up, {} down",
                    stats.hosts, stats.scale_ups, stats.scale_downs
                ),
                Err(PassError::LeadershipLost) => break,
                // The next pass restarts from a clean registry view.
                Err(e) => error!("monitor pass failed: {e}"),
            }
            if self.leadership.is_lost() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.monitor_interval) => {}
                _ = leadership.lost() => break,
                _ = &mut shutdown => return self.shutdown().await,
            }
        }

        warn!("leadership lost; idling until restart");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), anyhow::Error> {
        info!("shutting down");
        self.coordination.close().await;
        if let Some(dir) = &self.data_dir {
            self.registry.snapshot(dir).await?;
        }
        Ok(())
    }
}
