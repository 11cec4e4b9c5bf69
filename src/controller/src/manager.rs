// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The node manager.
//!
//! One monitor pass works through four stages: snapshot the registry, gather
//! telemetry for every host concurrently, classify each host in registry
//! order, then drain the scale-up queue followed by the scale-down queue.
//! Intents that fail transiently at the provider are pushed back onto the
//! front of their queue so the retry runs ahead of fresh work, up to a small
//! attempt budget.
//!
//! The manager holds no provider or telemetry implementation of its own —
//! everything below it enters through a trait object in
//! [`NodeManagerConfig`] — and it refuses to touch a provider once
//! leadership is gone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use fleet_coord::LeadershipHandle;
use fleet_ore::now::{NowFn, SYSTEM_TIME};
use fleet_provider::{InstanceSpec, ProviderError, Providers, DEFAULT_PROVIDER_TIMEOUT};
use fleet_registry::{Registry, RegistryError};
use fleet_telemetry::{collect_snapshot, CollectOptions, TelemetryClient};

use crate::balance::rank_hosts;
use crate::policy::{evaluate, ScaleDecision, Thresholds};
use crate::queue::IntentQueue;
use crate::{Host, IntentKind, NodeRecord, PassError, ScalingIntent};

/// How many times a transiently failing provider call is attempted before
/// the intent is dropped.
pub const DEFAULT_RETRY_BUDGET: u64 = 3;

/// Signals a workload that its host is about to be replaced.
///
/// Delivery is best effort: a workload that cannot be warned is replaced
/// anyway.
#[async_trait]
pub trait WorkloadSignaler: Send + Sync {
    /// Asks the named workload to wind down.
    async fn graceful_shutdown(&self, address: &str, workload: &str) -> Result<(), anyhow::Error>;
}

/// A signaler for fleets whose workloads need no warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSignaler;

#[async_trait]
impl WorkloadSignaler for NoopSignaler {
    async fn graceful_shutdown(&self, _: &str, _: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Configures a [`NodeManager`].
pub struct NodeManagerConfig {
    /// How the manager observes hosts.
    pub telemetry: Arc<dyn TelemetryClient>,
    /// The adapters for every cloud the fleet spans.
    pub providers: Providers,
    /// How workloads are warned before replacement.
    pub signaler: Arc<dyn WorkloadSignaler>,
    /// The policy thresholds.
    pub thresholds: Thresholds,
    /// Telemetry deadlines and primary interface/disk names.
    pub collect: CollectOptions,
    /// The per-call provider deadline.
    pub provider_timeout: Duration,
    /// Attempts per intent before it is dropped.
    pub retry_budget: u64,
    /// The shape of instances created on scale-up.
    pub instance_spec: InstanceSpec,
    /// The clock used to stamp workload generations.
    pub now: NowFn,
}

impl std::fmt::Debug for NodeManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeManagerConfig")
            .field("thresholds", &self.thresholds)
            .field("collect", &self.collect)
            .field("provider_timeout", &self.provider_timeout)
            .field("retry_budget", &self.retry_budget)
            .finish_non_exhaustive()
    }
}

impl NodeManagerConfig {
    /// Creates a configuration with default policy, deadlines, and clock.
    pub fn new(telemetry: Arc<dyn TelemetryClient>, providers: Providers) -> NodeManagerConfig {
        NodeManagerConfig {
            telemetry,
            providers,
            signaler: Arc::new(NoopSignaler),
            thresholds: Thresholds::default(),
            collect: CollectOptions::default(),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            instance_spec: InstanceSpec::default(),
            now: SYSTEM_TIME.clone(),
        }
    }
}

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassStats {
    /// Hosts observed in the registry snapshot.
    pub hosts: usize,
    /// Scale-up intents enqueued.
    pub scale_ups: usize,
    /// Scale-down intents enqueued.
    pub scale_downs: usize,
    /// Hosts ranked by load, least loaded first.
    pub ranking: Vec<(String, f64)>,
}

/// Orchestrates monitor → evaluate → enqueue → dispatch.
pub struct NodeManager {
    registry: Arc<Registry<NodeRecord>>,
    leadership: LeadershipHandle,
    config: NodeManagerConfig,
    queue_up: IntentQueue<ScalingIntent>,
    queue_down: IntentQueue<ScalingIntent>,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NodeManager {
    /// Creates a manager over the given registry.
    pub fn new(
        registry: Arc<Registry<NodeRecord>>,
        leadership: LeadershipHandle,
        config: NodeManagerConfig,
    ) -> NodeManager {
        NodeManager {
            registry,
            leadership,
            config,
            queue_up: IntentQueue::new(),
            queue_down: IntentQueue::new(),
        }
    }

    /// Adds a host to the registry.
    pub async fn register_node(
        &self,
        address: &str,
        record: NodeRecord,
    ) -> Result<(), RegistryError> {
        info!("registering node {} at {address}", record.workload);
        self.registry.put(address, record).await
    }

    /// Removes a host from the registry.
    pub async fn unregister_node(&self, address: &str) -> Result<(), RegistryError> {
        info!("unregistering node at {address}");
        self.registry.remove(address).await
    }

    /// Runs one monitor pass over the fleet.
    pub async fn monitor_pass(&self) -> Result<PassStats, PassError> {
        let entries = self.registry.entries().await.map_err(PassError::Registry)?;
        let snapshots = futures::future::join_all(entries.iter().map(|(address, _)| {
            collect_snapshot(&*self.config.telemetry, address, &self.config.collect)
        }))
        .await;

        // Classify in registry-traversal order; the queues then hold intents
        // in that same order.
        let now = self.config.now.as_secs();
        let mut stats = PassStats {
            hosts: entries.len(),
            ..Default::default()
        };
        for ((address, record), snapshot) in entries.iter().zip(&snapshots) {
            let decision = evaluate(
                snapshot,
                &self.config.thresholds,
                &self.config.collect.interface,
                &self.config.collect.disk,
            );
            match decision {
                ScaleDecision::Up { reason } => {
                    info!(
                        "scale-up queued for {} at {address}: {reason}",
                        record.workload
                    );
                    let new_workload = format!("{}_{now}", record.workload);
                    self.queue_up
                        .push_back(ScalingIntent {
                            kind: IntentKind::Up,
                            host: Host {
                                address: address.clone(),
                                record: record.clone(),
                            },
                            generation: now,
                            new_workload: Some(new_workload),
                            attempts: 0,
                        })
                        .await;
                    stats.scale_ups += 1;
                }
                ScaleDecision::Down => {
                    info!("scale-down queued for {} at {address}", record.workload);
                    self.queue_down
                        .push_back(ScalingIntent {
                            kind: IntentKind::Down,
                            host: Host {
                                address: address.clone(),
                                record: record.clone(),
                            },
                            generation: now,
                            new_workload: None,
                            attempts: 0,
                        })
                        .await;
                    stats.scale_downs += 1;
                }
                ScaleDecision::None => {}
            }
        }

        stats.ranking = rank_hosts(
            entries
                .iter()
                .map(|(address, _)| address.clone())
                .zip(snapshots),
            &self.config.collect.interface,
        );
        for (address, load) in &stats.ranking {
            debug!("node {address} has load {load:.1}");
        }

        let drained = match self.drain(&self.queue_up).await {
            Ok(()) => self.drain(&self.queue_down).await,
            Err(e) => Err(e),
        };
        if let Err(e) = drained {
            self.discard_queues().await;
            return Err(e);
        }
        Ok(stats)
    }

    async fn drain(&self, queue: &IntentQueue<ScalingIntent>) -> Result<(), PassError> {
        while let Some(intent) = queue.try_pop().await {
            if !self.leadership.is_leader() {
                return Err(PassError::LeadershipLost);
            }
            match intent.kind {
                IntentKind::Up => self.dispatch_up(intent).await?,
                IntentKind::Down => self.dispatch_down(intent).await?,
            }
        }
        Ok(())
    }

    async fn discard_queues(&self) {
        let mut discarded = 0;
        while self.queue_up.try_pop().await.is_some() {
            discarded += 1;
        }
        while self.queue_down.try_pop().await.is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!("discarded {discarded} queued intents");
        }
    }

    async fn dispatch_up(&self, mut intent: ScalingIntent) -> Result<(), PassError> {
        let address = intent.host.address.clone();
        // The host may have vanished since the intent was enqueued.
        let record = match self.registry.get(&address).await {
            Ok(record) => record,
            Err(RegistryError::NotFound) => {
                info!("host {address} vanished before dispatch; dropping scale-up");
                return Ok(());
            }
            Err(e) => return Err(PassError::Registry(e)),
        };
        let Some(adapter) = self.config.providers.get(record.provider) else {
            error!("no adapter configured for {} (host {address})", record.provider);
            return Ok(());
        };
        let new_workload = intent
            .new_workload
            .clone()
            .expect("scale-up intents carry a replacement workload name");

        // Warn the incumbent. Failure must not block the replacement.
        if let Err(e) = self
            .config
            .signaler
            .graceful_shutdown(&address, &record.workload)
            .await
        {
            warn!(
                "graceful shutdown of {} at {address} failed: {e:#}",
                record.workload
            );
        }

        if !self.leadership.is_leader() {
            return Err(PassError::LeadershipLost);
        }
        let created = self
            .provider_call(adapter.create_instance(&new_workload, &self.config.instance_spec))
            .await;
        match created {
            Ok(created) => {
                let new_record = NodeRecord {
                    workload: new_workload.clone(),
                    provider: record.provider,
                    instance_id: Some(created.instance_id.clone()),
                    region: self.config.instance_spec.region.clone(),
                };
                if let Err(e) = self.register_node(&created.address, new_record).await {
                    // The instance exists but the registry does not know it,
                    // and nothing reconciles instances we did not record.
                    warn!(
                        "instance {} at {} may be leaked: registration failed: {e}",
                        created.instance_id, created.address
                    );
                    return Err(PassError::Registry(e));
                }
                self.unregister_node(&address)
                    .await
                    .map_err(PassError::Registry)?;
                info!(
                    "scaled up {} to {new_workload} at {}",
                    record.workload, created.address
                );
                Ok(())
            }
            Err(e) if e.is_transient() => {
                intent.attempts += 1;
                if intent.attempts < self.config.retry_budget {
                    debug!(
                        "scale-up of {} will retry (attempt {} of {}): {e}",
                        record.workload, intent.attempts, self.config.retry_budget
                    );
                    self.queue_up.push_front(intent).await;
                } else {
                    error!(
                        "dropping scale-up of {} after {} attempts: {e}",
                        record.workload, intent.attempts
                    );
                }
                Ok(())
            }
            Err(e) => {
                error!("scale-up of {} failed: {e}", record.workload);
                Ok(())
            }
        }
    }

    async fn dispatch_down(&self, mut intent: ScalingIntent) -> Result<(), PassError> {
        let address = intent.host.address.clone();
        let record = match self.registry.get(&address).await {
            Ok(record) => record,
            Err(RegistryError::NotFound) => {
                info!("host {address} vanished before dispatch; dropping scale-down");
                return Ok(());
            }
            Err(e) => return Err(PassError::Registry(e)),
        };

        if !self.leadership.is_leader() {
            return Err(PassError::LeadershipLost);
        }
        let Some(instance_id) = record.instance_id.clone() else {
            // Never provisioned by us; there is nothing to terminate.
            warn!("host {address} has no instance id; unregistering without termination");
            self.unregister_node(&address)
                .await
                .map_err(PassError::Registry)?;
            return Ok(());
        };
        let Some(adapter) = self.config.providers.get(record.provider) else {
            error!("no adapter configured for {} (host {address})", record.provider);
            return Ok(());
        };

        let delete = adapter.delete_instance(&instance_id, record.region.as_deref());
        match self.provider_call(delete).await {
            Ok(()) => {
                self.unregister_node(&address)
                    .await
                    .map_err(PassError::Registry)?;
                info!("scaled down {} at {address}", record.workload);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                intent.attempts += 1;
                if intent.attempts < self.config.retry_budget {
                    debug!(
                        "scale-down of {} will retry (attempt {} of {}): {e}",
                        record.workload, intent.attempts, self.config.retry_budget
                    );
                    self.queue_down.push_front(intent).await;
                } else {
                    error!(
                        "dropping scale-down of {} after {} attempts: {e}",
                        record.workload, intent.attempts
                    );
                }
                Ok(())
            }
            Err(e) => {
                error!("scale-down of {} failed: {e}", record.workload);
                Ok(())
            }
        }
    }

    async fn provider_call<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.config.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(anyhow!(
                "provider deadline elapsed"
            ))),
        }
    }
}
