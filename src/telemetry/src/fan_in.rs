// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Fan-in aggregation over a broadcast metric transport.
//!
//! The remote transport delivers each metric request to every member of the
//! cluster. Only the member whose address matches the target computes a real
//! value; every other member contributes zero. The coordinator therefore
//! recovers the one real measurement by summing all contributions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{TelemetryClient, TelemetryError, GPU_METRIC_NAMES};

/// A scalar metric request, addressed to one host but delivered to all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricRequest {
    /// CPU temperature of the target.
    CpuTemperature { address: String },
    /// Page faults since boot on the target.
    MemoryPageFaults { address: String },
    /// Available memory on the target, in MB.
    AvailableMemoryMb { address: String },
    /// Bandwidth utilization of one interface on the target, in MB/s.
    NetworkBandwidthUtilization { address: String, interface: String },
    /// Latency of one disk device on the target, in milliseconds.
    DiskLatency { address: String, device: String },
}

/// The broadcast transport underneath [`FanInTelemetryClient`].
///
/// Implementations deliver the request to every cluster member and gather
/// one contribution per member. Members that are not the target contribute
/// zero.
#[async_trait]
pub trait MetricFanIn: Send + Sync {
    /// Broadcasts a scalar request and gathers all contributions.
    async fn broadcast(&self, request: MetricRequest) -> Result<Vec<f64>, TelemetryError>;

    /// Broadcasts a GPU metrics request and gathers one map per member.
    ///
    /// Non-target members contribute an empty map (or all-zero values).
    async fn broadcast_gpu(
        &self,
        address: &str,
        gpu_index: u32,
    ) -> Result<Vec<BTreeMap<String, f64>>, TelemetryError>;
}

/// A [`TelemetryClient`] that recovers per-host metrics from a broadcast
/// transport by summing contributions.
#[derive(Clone)]
pub struct FanInTelemetryClient {
    transport: Arc<dyn MetricFanIn>,
}

impl std::fmt::Debug for FanInTelemetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FanInTelemetryClient").finish_non_exhaustive()
    }
}

impl FanInTelemetryClient {
    /// Creates a client over the given transport.
    pub fn new(transport: Arc<dyn MetricFanIn>) -> FanInTelemetryClient {
        FanInTelemetryClient { transport }
    }

    async fn sum(&self, request: MetricRequest) -> Result<f64, TelemetryError> {
        let contributions = self.transport.broadcast(request).await?;
        Ok(contributions.into_iter().sum())
    }
}

#[async_trait]
impl TelemetryClient for FanInTelemetryClient {
    async fn cpu_temperature(&self, address: &str) -> Result<f64, TelemetryError> {
        self.sum(MetricRequest::CpuTemperature {
            address: address.to_string(),
        })
        .await
    }

    async fn memory_page_faults(&self, address: &str) -> Result<f64, TelemetryError> {
        self.sum(MetricRequest::MemoryPageFaults {
            address: address.to_string(),
        })
        .await
    }

    async fn available_memory_mb(&self, address: &str) -> Result<f64, TelemetryError> {
        self.sum(MetricRequest::AvailableMemoryMb {
            address: address.to_string(),
        })
        .await
    }

    async fn network_bandwidth_utilization(
        &self,
        address: &str,
        interface: &str,
    ) -> Result<f64, TelemetryError> {
        self.sum(MetricRequest::NetworkBandwidthUtilization {
            address: address.to_string(),
            interface: interface.to_string(),
        })
        .await
    }

    async fn disk_latency(&self, address: &str, device: &str) -> Result<f64, TelemetryError> {
        self.sum(MetricRequest::DiskLatency {
            address: address.to_string(),
            device: device.to_string(),
        })
        .await
    }

    async fn gpu_metrics(
        &self,
        address: &str,
        gpu_index: u32,
    ) -> Result<BTreeMap<String, f64>, TelemetryError> {
        let contributions = self.transport.broadcast_gpu(address, gpu_index).await?;
        let mut merged: BTreeMap<String, f64> = GPU_METRIC_NAMES
            .iter()
            .map(|name| (name.to_string(), 0.0))
            .collect();
        for contribution in contributions {
            for (name, value) in contribution {
                *merged.entry(name).or_insert(0.0) += value;
            }
        }
        Ok(merged)
    }
}
