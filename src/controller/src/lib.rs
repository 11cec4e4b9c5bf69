// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The control plane of the fleet controller.
//!
//! The [`NodeManager`] is the heart of the system: on every monitor pass it
//! walks the registered hosts, gathers a telemetry snapshot per host,
//! classifies each snapshot with the scaling policy, queues the resulting
//! intents, and then drains the queues by invoking the appropriate provider
//! adapter. The manager runs only while this process holds leadership, and
//! it re-checks leadership before every provider write.
//!
//! The pieces are deliberately small and separable: [`queue`] is the
//! double-ended intent queue, [`policy`] is a pure function from snapshot to
//! decision, [`balance`] ranks hosts by load for placement hints, and
//! [`manager`] wires them together.

use std::fmt;

use serde::{Deserialize, Serialize};

use fleet_provider::CloudProvider;
use fleet_registry::RegistryError;

pub mod balance;
pub mod manager;
pub mod policy;
pub mod queue;

pub use manager::{NodeManager, NodeManagerConfig, NoopSignaler, PassStats, WorkloadSignaler};
pub use policy::{evaluate, ScaleDecision, Thresholds};
pub use queue::IntentQueue;

/// What the registry knows about one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The workload assigned to the host.
    pub workload: String,
    /// The cloud the host lives in.
    pub provider: CloudProvider,
    /// The provider's id for the instance. Absent for hosts that were
    /// registered rather than provisioned; such hosts cannot be terminated
    /// by us.
    pub instance_id: Option<String>,
    /// The region or zone the instance was created in. Termination must
    /// target the same region on the providers that scope deletes by it.
    pub region: Option<String>,
}

/// A managed host: a registry entry together with its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// The host's stable address, the registry's primary key.
    pub address: String,
    /// The registry record at the time the host was observed.
    pub record: NodeRecord,
}

/// Which way an intent scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Up,
    Down,
}

/// A pending scaling action for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingIntent {
    /// The direction to scale.
    pub kind: IntentKind,
    /// The host the intent refers to. The host may vanish from the registry
    /// before the intent is dispatched; dispatch tolerates this.
    pub host: Host,
    /// The wall-clock second the intent was created, which disambiguates
    /// workload generations.
    pub generation: u64,
    /// For scale-ups, the name the replacement workload will carry:
    /// the old name with the generation appended.
    pub new_workload: Option<String>,
    /// How many times dispatch has already been attempted.
    pub attempts: u64,
}

/// An error that aborts the current monitor pass.
#[derive(Debug)]
pub enum PassError {
    /// Leadership was lost. All queued work is discarded and the manager
    /// returns to the director.
    LeadershipLost,
    /// The registry failed; the pass cannot trust its view of the fleet.
    /// The next pass restarts cleanly.
    Registry(RegistryError),
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PassError::LeadershipLost => f.write_str("leadership lost"),
            PassError::Registry(e) => write!(f, "registry error: {e}"),
        }
    }
}

impl std::error::Error for PassError {}
