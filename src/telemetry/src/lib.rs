// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Telemetry collection for managed hosts.
//!
//! The controller observes hosts exclusively through the [`TelemetryClient`]
//! trait; whether a metric comes from a local probe or a remote agent is the
//! transport's business. Every call can fail or time out independently, and
//! a failed call simply leaves the corresponding metric unknown in the
//! [`TelemetrySnapshot`] — the scaling policy is written to treat unknown
//! conservatively.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod fan_in;

/// The default per-call telemetry deadline.
pub const DEFAULT_TELEMETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// The interface consulted when a caller does not name one.
pub const DEFAULT_PRIMARY_INTERFACE: &str = "eth0";

/// The disk device consulted when a caller does not name one.
pub const DEFAULT_PRIMARY_DISK: &str = "/dev/sda";

/// The GPU usage key within [`TelemetrySnapshot::gpu`].
pub const GPU_USAGE: &str = "GpuUsage";

/// The metric names reported per GPU.
pub const GPU_METRIC_NAMES: [&str; 7] = [
    GPU_USAGE,
    "GpuTemperature",
    "GpuMemoryUsage",
    "GpuPowerUsage",
    "GpuFanSpeed",
    "GpuCoreClock",
    "GpuMemoryClock",
];

/// An error produced by a telemetry fetch.
#[derive(Debug)]
pub enum TelemetryError {
    /// The metric could not be produced. The caller treats the metric as
    /// unknown; a single failure is not retried.
    Unavailable(anyhow::Error),
    /// The per-call deadline elapsed.
    TimedOut,
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TelemetryError::Unavailable(e) => write!(f, "metric unavailable: {e:#}"),
            TelemetryError::TimedOut => f.write_str("telemetry deadline elapsed"),
        }
    }
}

impl std::error::Error for TelemetryError {}

/// Fetches metrics for one host.
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    /// CPU temperature in degrees Celsius.
    async fn cpu_temperature(&self, address: &str) -> Result<f64, TelemetryError>;

    /// Memory page faults since boot.
    async fn memory_page_faults(&self, address: &str) -> Result<f64, TelemetryError>;

    /// Available memory in megabytes.
    async fn available_memory_mb(&self, address: &str) -> Result<f64, TelemetryError>;

    /// Bandwidth utilization of the named interface, in MB/s.
    async fn network_bandwidth_utilization(
        &self,
        address: &str,
        interface: &str,
    ) -> Result<f64, TelemetryError>;

    /// Latency of the named disk device, in milliseconds.
    async fn disk_latency(&self, address: &str, device: &str) -> Result<f64, TelemetryError>;

    /// The named GPU metrics (see [`GPU_METRIC_NAMES`]) for one GPU.
    async fn gpu_metrics(
        &self,
        address: &str,
        gpu_index: u32,
    ) -> Result<BTreeMap<String, f64>, TelemetryError>;
}

/// Metrics for one host at one instant. Missing metrics are absent, not zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// CPU temperature in degrees Celsius.
    pub cpu_temperature: Option<f64>,
    /// Memory page faults since boot.
    pub memory_page_faults: Option<f64>,
    /// Available memory in megabytes.
    pub available_memory_mb: Option<f64>,
    /// Bandwidth utilization in MB/s, per interface.
    pub network_bandwidth_mbps: BTreeMap<String, f64>,
    /// Disk latency in milliseconds, per device.
    pub disk_latency_ms: BTreeMap<String, f64>,
    /// GPU metrics, keyed by the names in [`GPU_METRIC_NAMES`].
    pub gpu: BTreeMap<String, f64>,
}

impl TelemetrySnapshot {
    /// The bandwidth utilization of `interface`, if known.
    pub fn network_bandwidth(&self, interface: &str) -> Option<f64> {
        self.network_bandwidth_mbps.get(interface).copied()
    }

    /// The latency of `device`, if known.
    pub fn disk_latency(&self, device: &str) -> Option<f64> {
        self.disk_latency_ms.get(device).copied()
    }

    /// The GPU usage percentage, if known.
    pub fn gpu_usage(&self) -> Option<f64> {
        self.gpu.get(GPU_USAGE).copied()
    }
}

/// Options governing [`collect_snapshot`].
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// The per-call deadline.
    pub timeout: Duration,
    /// The interface whose bandwidth feeds the policy.
    pub interface: String,
    /// The disk device whose latency feeds the policy.
    pub disk: String,
    /// Which GPU to sample.
    pub gpu_index: u32,
}

impl Default for CollectOptions {
    fn default() -> Self {
        CollectOptions {
            timeout: DEFAULT_TELEMETRY_TIMEOUT,
            interface: DEFAULT_PRIMARY_INTERFACE.to_string(),
            disk: DEFAULT_PRIMARY_DISK.to_string(),
            gpu_index: 0,
        }
    }
}

/// Collects the six metric families for `address` into one snapshot.
///
/// The families are fetched concurrently, each under its own deadline. Any
/// failure or timeout leaves that family unknown.
pub async fn collect_snapshot(
    client: &dyn TelemetryClient,
    address: &str,
    opts: &CollectOptions,
) -> TelemetrySnapshot {
    let (cpu, faults, mem, net, disk, gpu) = tokio::join!(
        fetch(address, "cpu_temperature", opts, client.cpu_temperature(address)),
        fetch(address, "memory_page_faults", opts, client.memory_page_faults(address)),
        fetch(address, "available_memory_mb", opts, client.available_memory_mb(address)),
        fetch(
            address,
            "network_bandwidth_utilization",
            opts,
            client.network_bandwidth_utilization(address, &opts.interface),
        ),
        fetch(address, "disk_latency", opts, client.disk_latency(address, &opts.disk)),
        fetch(address, "gpu_metrics", opts, client.gpu_metrics(address, opts.gpu_index)),
    );

    let mut snapshot = TelemetrySnapshot {
        cpu_temperature: cpu,
        memory_page_faults: faults,
        available_memory_mb: mem,
        ..Default::default()
    };
    if let Some(net) = net {
        snapshot
            .network_bandwidth_mbps
            .insert(opts.interface.clone(), net);
    }
    if let Some(disk) = disk {
        snapshot.disk_latency_ms.insert(opts.disk.clone(), disk);
    }
    if let Some(gpu) = gpu {
        snapshot.gpu = gpu;
    }
    snapshot
}

async fn fetch<T>(
    address: &str,
    metric: &str,
    opts: &CollectOptions,
    fut: impl std::future::Future<Output = Result<T, TelemetryError>>,
) -> Option<T> {
    let result = match tokio::time::timeout(opts.timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TelemetryError::TimedOut),
    };
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("metric {metric} unknown for {address}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedClient;

    #[async_trait]
    impl TelemetryClient for ScriptedClient {
        async fn cpu_temperature(&self, _: &str) -> Result<f64, TelemetryError> {
            // Blows through any reasonable deadline.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(85.0)
        }

        async fn memory_page_faults(&self, _: &str) -> Result<f64, TelemetryError> {
            Ok(1500.0)
        }

        async fn available_memory_mb(&self, _: &str) -> Result<f64, TelemetryError> {
            Err(TelemetryError::Unavailable(anyhow::anyhow!("agent down")))
        }

        async fn network_bandwidth_utilization(
            &self,
            _: &str,
            _: &str,
        ) -> Result<f64, TelemetryError> {
            Ok(120.0)
        }

        async fn disk_latency(&self, _: &str, _: &str) -> Result<f64, TelemetryError> {
            Ok(1.5)
        }

        async fn gpu_metrics(
            &self,
            _: &str,
            _: u32,
        ) -> Result<BTreeMap<String, f64>, TelemetryError> {
            Ok(BTreeMap::from([(GPU_USAGE.to_string(), 40.0)]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_and_errors_leave_metrics_unknown() {
        let opts = CollectOptions::default();
        let snapshot = collect_snapshot(&ScriptedClient, "10.0.0.1", &opts).await;

        assert_eq!(snapshot.cpu_temperature, None);
        assert_eq!(snapshot.memory_page_faults, Some(1500.0));
        assert_eq!(snapshot.available_memory_mb, None);
        assert_eq!(snapshot.network_bandwidth(DEFAULT_PRIMARY_INTERFACE), Some(120.0));
        assert_eq!(snapshot.disk_latency(DEFAULT_PRIMARY_DISK), Some(1.5));
        assert_eq!(snapshot.gpu_usage(), Some(40.0));
    }
}
