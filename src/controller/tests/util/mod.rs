// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Harness for end-to-end controller scenarios: a real registry, real
//! queues, and real leader election over the in-process coordination
//! service, with scripted telemetry and a synthetic provider at the edges.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use fleet_controller::{NodeManager, NodeManagerConfig, NodeRecord};
use fleet_coord::{LeaderElection, LeadershipHandle, MemoryCoordination, MemorySession};
use fleet_ore::now::NowFn;
use fleet_provider::{CloudProvider, InstanceSpec, MemoryProvider, Providers};
use fleet_registry::Registry;
use fleet_telemetry::{TelemetryClient, TelemetryError, GPU_USAGE};

/// The fixed wall-clock second every scenario runs at; workload generations
/// are derived from it.
pub const NOW_SECS: u64 = 1_700_000_000;

/// Scripted per-host metrics. `None` models a metric the transport could not
/// produce.
#[derive(Debug, Clone, Default)]
pub struct HostMetrics {
    pub cpu_temperature: Option<f64>,
    pub memory_page_faults: Option<f64>,
    pub available_memory_mb: Option<f64>,
    pub network_bandwidth: Option<f64>,
    pub disk_latency: Option<f64>,
    pub gpu_usage: Option<f64>,
}

impl HostMetrics {
    /// A host with nothing to report: every metric comfortably mid-range.
    pub fn nominal() -> HostMetrics {
        HostMetrics {
            cpu_temperature: Some(50.0),
            memory_page_faults: Some(100.0),
            available_memory_mb: Some(2048.0),
            network_bandwidth: Some(100.0),
            disk_latency: Some(5.0),
            gpu_usage: Some(50.0),
        }
    }
}

type FetchHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A telemetry client that reads from a script instead of a transport.
#[derive(Default)]
pub struct ScriptedTelemetry {
    hosts: Mutex<BTreeMap<String, HostMetrics>>,
    on_next_fetch: Mutex<Option<FetchHook>>,
}

impl ScriptedTelemetry {
    pub fn set(&self, address: &str, metrics: HostMetrics) {
        self.hosts
            .lock()
            .unwrap()
            .insert(address.to_string(), metrics);
    }

    /// Runs `f` when the next metric is fetched. Scenarios use this to
    /// inject failures (like leadership loss) mid-pass, after the pass has
    /// started but before any intent is dispatched.
    pub fn on_next_fetch<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.on_next_fetch.lock().unwrap() = Some(Box::new(move || f().boxed()));
    }

    async fn metric(
        &self,
        address: &str,
        select: impl Fn(&HostMetrics) -> Option<f64>,
    ) -> Result<f64, TelemetryError> {
        let hook = self.on_next_fetch.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
        self.hosts
            .lock()
            .unwrap()
            .get(address)
            .and_then(|metrics| select(metrics))
            .ok_or_else(|| TelemetryError::Unavailable(anyhow!("no scripted value")))
    }
}

#[async_trait]
impl TelemetryClient for ScriptedTelemetry {
    async fn cpu_temperature(&self, address: &str) -> Result<f64, TelemetryError> {
        self.metric(address, |m| m.cpu_temperature).await
    }

    async fn memory_page_faults(&self, address: &str) -> Result<f64, TelemetryError> {
        self.metric(address, |m| m.memory_page_faults).await
    }

    async fn available_memory_mb(&self, address: &str) -> Result<f64, TelemetryError> {
        self.metric(address, |m| m.available_memory_mb).await
    }

    async fn network_bandwidth_utilization(
        &self,
        address: &str,
        _interface: &str,
    ) -> Result<f64, TelemetryError> {
        self.metric(address, |m| m.network_bandwidth).await
    }

    async fn disk_latency(&self, address: &str, _device: &str) -> Result<f64, TelemetryError> {
        self.metric(address, |m| m.disk_latency).await
    }

    async fn gpu_metrics(
        &self,
        address: &str,
        _gpu_index: u32,
    ) -> Result<BTreeMap<String, f64>, TelemetryError> {
        let usage = self.metric(address, |m| m.gpu_usage).await?;
        Ok(BTreeMap::from([
            (GPU_USAGE.to_string(), usage),
            ("GpuTemperature".to_string(), 70.0),
        ]))
    }
}

/// Everything a scenario needs, wired the way `directord` wires it.
pub struct Harness {
    pub coord: MemoryCoordination,
    pub session: MemorySession,
    pub leadership: LeadershipHandle,
    pub registry: Arc<Registry<NodeRecord>>,
    pub provider: Arc<MemoryProvider>,
    pub telemetry: Arc<ScriptedTelemetry>,
    pub manager: NodeManager,
}

/// Starts a harness whose controller already holds leadership.
pub async fn start() -> Harness {
    start_with_spec(InstanceSpec::default()).await
}

/// Like [`start`], creating replacement instances with the given spec.
pub async fn start_with_spec(spec: InstanceSpec) -> Harness {
    let coord = MemoryCoordination::new();
    let session = coord.session();
    let (election, mut leadership) = LeaderElection::new(
        Arc::new(session.clone()),
        fleet_coord::DEFAULT_LEADER_PATH,
        b"10.0.0.100".to_vec(),
    );
    tokio::spawn(election.run());
    assert!(leadership.wait_leader().await, "harness must start as leader");

    let registry = Arc::new(Registry::start(2));
    let provider = Arc::new(MemoryProvider::new(CloudProvider::Aws));
    let telemetry = Arc::new(ScriptedTelemetry::default());

    let mut providers = Providers::new();
    providers.register(Arc::clone(&provider) as _);
    let mut config = NodeManagerConfig::new(Arc::clone(&telemetry) as _, providers);
    config.now = NowFn::from(|| NOW_SECS * 1_000);
    config.instance_spec = spec;

    let manager = NodeManager::new(Arc::clone(&registry), leadership.clone(), config);
    Harness {
        coord,
        session,
        leadership,
        registry,
        provider,
        telemetry,
        manager,
    }
}

/// A registry record for a host we provisioned earlier.
pub fn record(workload: &str, instance_id: &str) -> NodeRecord {
    NodeRecord {
        workload: workload.to_string(),
        provider: CloudProvider::Aws,
        instance_id: Some(instance_id.to_string()),
        region: None,
    }
}
