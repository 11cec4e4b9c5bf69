// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The scaling policy.
//!
//! [`evaluate`] is a pure function from one telemetry snapshot to a scaling
//! decision. Scale-up rules are checked in a fixed order and the first hit
//! wins, so the reported reason is deterministic. Unknown metrics never
//! trigger a scale-up, and they disqualify a scale-down: we only shed
//! capacity from a host we can see clearly.

use serde::{Deserialize, Serialize};

use fleet_telemetry::TelemetrySnapshot;

/// Scale-up reason: CPU temperature above threshold.
pub const REASON_CPU_TEMPERATURE: &str = "CpuTemperature";
/// Scale-up reason: page-fault count above threshold.
pub const REASON_MEMORY_PAGE_FAULTS: &str = "MemoryPageFaults";
/// Scale-up reason: primary interface bandwidth above threshold.
pub const REASON_NETWORK_BANDWIDTH: &str = "NetworkBandwidthUtilization";
/// Scale-up reason: GPU usage above threshold.
pub const REASON_GPU_USAGE: &str = "GpuUsage";
/// Scale-up reason: available memory below threshold.
pub const REASON_AVAILABLE_MEMORY: &str = "AvailableMemoryMb";
/// Scale-up reason: primary disk latency above threshold.
pub const REASON_DISK_LATENCY: &str = "DiskLatency";

/// The thresholds the policy compares against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Scale up above this CPU temperature, in °C.
    pub cpu_temperature_max: f64,
    /// Scale up above this many page faults.
    pub memory_page_faults_max: f64,
    /// Scale up above this bandwidth on the primary interface, in MB/s.
    pub network_bandwidth_max_mbps: f64,
    /// Scale up above this GPU usage, in percent.
    pub gpu_usage_max: f64,
    /// Scale up below this much available memory, in MB.
    pub available_memory_min_mb: f64,
    /// Scale up above this latency on the primary disk, in milliseconds.
    pub disk_latency_max_ms: f64,
    /// A host is idle only at or below this CPU temperature, in °C.
    pub idle_cpu_temperature: f64,
    /// A host is idle only at or below this GPU usage, in percent.
    pub idle_gpu_usage: f64,
    /// A host is idle only at or above this much available memory, in MB.
    pub idle_available_memory_mb: f64,
    /// A host is idle only at or below this disk latency, in milliseconds.
    pub idle_disk_latency_ms: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            cpu_temperature_max: 80.0,
            memory_page_faults_max: 1000.0,
            network_bandwidth_max_mbps: 1000.0,
            gpu_usage_max: 80.0,
            available_memory_min_mb: 512.0,
            disk_latency_max_ms: 10.0,
            idle_cpu_temperature: 40.0,
            idle_gpu_usage: 20.0,
            idle_available_memory_mb: 4096.0,
            idle_disk_latency_ms: 2.0,
        }
    }
}

/// What the policy decided for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// The host is overloaded; provision a replacement.
    Up {
        /// The first rule that fired.
        reason: &'static str,
    },
    /// The host is idle enough to shed.
    Down,
    /// Leave the host alone.
    None,
}

/// Classifies one snapshot.
///
/// `interface` and `disk` name the primary interface and disk device whose
/// measurements feed the bandwidth and latency rules.
pub fn evaluate(
    snapshot: &TelemetrySnapshot,
    thresholds: &Thresholds,
    interface: &str,
    disk: &str,
) -> ScaleDecision {
    let cpu = snapshot.cpu_temperature;
    let gpu = snapshot.gpu_usage();
    let memory = snapshot.available_memory_mb;
    let disk_latency = snapshot.disk_latency(disk);

    // Scale-up rules, in order; the first hit names the reason.
    let above = |value: Option<f64>, max: f64| value.map_or(false, |v| v > max);
    if above(cpu, thresholds.cpu_temperature_max) {
        return ScaleDecision::Up {
            reason: REASON_CPU_TEMPERATURE,
        };
    }
    if above(snapshot.memory_page_faults, thresholds.memory_page_faults_max) {
        return ScaleDecision::Up {
            reason: REASON_MEMORY_PAGE_FAULTS,
        };
    }
    if above(
        snapshot.network_bandwidth(interface),
        thresholds.network_bandwidth_max_mbps,
    ) {
        return ScaleDecision::Up {
            reason: REASON_NETWORK_BANDWIDTH,
        };
    }
    if above(gpu, thresholds.gpu_usage_max) {
        return ScaleDecision::Up {
            reason: REASON_GPU_USAGE,
        };
    }
    if memory.map_or(false, |v| v < thresholds.available_memory_min_mb) {
        return ScaleDecision::Up {
            reason: REASON_AVAILABLE_MEMORY,
        };
    }
    if above(disk_latency, thresholds.disk_latency_max_ms) {
        return ScaleDecision::Up {
            reason: REASON_DISK_LATENCY,
        };
    }

    // Scale down only when every idleness signal is both known and quiet.
    match (cpu, gpu, memory, disk_latency) {
        (Some(cpu), Some(gpu), Some(memory), Some(disk_latency))
            if cpu <= thresholds.idle_cpu_temperature
                && gpu <= thresholds.idle_gpu_usage
                && memory >= thresholds.idle_available_memory_mb
                && disk_latency <= thresholds.idle_disk_latency_ms =>
        {
            ScaleDecision::Down
        }
        _ => ScaleDecision::None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use fleet_telemetry::{DEFAULT_PRIMARY_DISK, DEFAULT_PRIMARY_INTERFACE, GPU_USAGE};

    use super::*;

    fn snapshot(
        cpu: Option<f64>,
        faults: Option<f64>,
        net: Option<f64>,
        gpu: Option<f64>,
        memory: Option<f64>,
        disk: Option<f64>,
    ) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cpu_temperature: cpu,
            memory_page_faults: faults,
            available_memory_mb: memory,
            network_bandwidth_mbps: net
                .map(|v| BTreeMap::from([(DEFAULT_PRIMARY_INTERFACE.to_string(), v)]))
                .unwrap_or_default(),
            disk_latency_ms: disk
                .map(|v| BTreeMap::from([(DEFAULT_PRIMARY_DISK.to_string(), v)]))
                .unwrap_or_default(),
            gpu: gpu
                .map(|v| BTreeMap::from([(GPU_USAGE.to_string(), v)]))
                .unwrap_or_default(),
        }
    }

    fn nominal() -> TelemetrySnapshot {
        snapshot(
            Some(50.0),
            Some(100.0),
            Some(100.0),
            Some(50.0),
            Some(2048.0),
            Some(5.0),
        )
    }

    fn decide(snapshot: &TelemetrySnapshot) -> ScaleDecision {
        evaluate(
            snapshot,
            &Thresholds::default(),
            DEFAULT_PRIMARY_INTERFACE,
            DEFAULT_PRIMARY_DISK,
        )
    }

    #[test]
    fn nominal_is_none() {
        assert_eq!(decide(&nominal()), ScaleDecision::None);
    }

    #[test]
    fn each_rule_flips_across_its_threshold() {
        // (mutator, expected reason); each pushes exactly one metric over.
        let cases: Vec<(fn(&mut TelemetrySnapshot), &str)> = vec![
            (|s| s.cpu_temperature = Some(80.1), REASON_CPU_TEMPERATURE),
            (|s| s.memory_page_faults = Some(1001.0), REASON_MEMORY_PAGE_FAULTS),
            (
                |s| {
                    s.network_bandwidth_mbps
                        .insert(DEFAULT_PRIMARY_INTERFACE.to_string(), 1000.5);
                },
                REASON_NETWORK_BANDWIDTH,
            ),
            (
                |s| {
                    s.gpu.insert(GPU_USAGE.to_string(), 80.5);
                },
                REASON_GPU_USAGE,
            ),
            (|s| s.available_memory_mb = Some(511.0), REASON_AVAILABLE_MEMORY),
            (
                |s| {
                    s.disk_latency_ms
                        .insert(DEFAULT_PRIMARY_DISK.to_string(), 10.5);
                },
                REASON_DISK_LATENCY,
            ),
        ];
        for (mutate, reason) in cases {
            let mut s = nominal();
            mutate(&mut s);
            assert_eq!(decide(&s), ScaleDecision::Up { reason }, "rule {reason}");
            // At the threshold itself, nothing fires.
            assert_eq!(decide(&nominal()), ScaleDecision::None);
        }
    }

    #[test]
    fn rule_order_breaks_ties() {
        let mut s = nominal();
        s.cpu_temperature = Some(95.0);
        s.gpu.insert(GPU_USAGE.to_string(), 95.0);
        assert_eq!(
            decide(&s),
            ScaleDecision::Up {
                reason: REASON_CPU_TEMPERATURE
            }
        );
    }

    #[test]
    fn idle_host_scales_down() {
        let s = snapshot(
            Some(25.0),
            Some(100.0),
            Some(10.0),
            Some(10.0),
            Some(8192.0),
            Some(1.0),
        );
        assert_eq!(decide(&s), ScaleDecision::Down);
    }

    #[test]
    fn unknown_metric_disqualifies_down() {
        let mut s = snapshot(
            Some(25.0),
            Some(100.0),
            Some(10.0),
            Some(10.0),
            Some(8192.0),
            Some(1.0),
        );
        s.gpu.clear();
        assert_eq!(decide(&s), ScaleDecision::None);
    }

    #[test]
    fn all_unknown_is_none() {
        assert_eq!(decide(&TelemetrySnapshot::default()), ScaleDecision::None);
    }

    proptest! {
        // Purity: the same snapshot always classifies the same way.
        #[test]
        fn deterministic(
            cpu in proptest::option::of(0.0f64..120.0),
            faults in proptest::option::of(0.0f64..10_000.0),
            net in proptest::option::of(0.0f64..5_000.0),
            gpu in proptest::option::of(0.0f64..100.0),
            memory in proptest::option::of(0.0f64..16_384.0),
            disk in proptest::option::of(0.0f64..50.0),
        ) {
            let s = snapshot(cpu, faults, net, gpu, memory, disk);
            prop_assert_eq!(decide(&s), decide(&s));
        }

        // Unknowns can only make the policy more conservative: filling in a
        // missing CPU reading never turns an Up into a None.
        #[test]
        fn unknown_cpu_never_triggers_up(
            faults in proptest::option::of(0.0f64..999.0),
            net in proptest::option::of(0.0f64..999.0),
        ) {
            let s = snapshot(None, faults, net, Some(10.0), Some(8192.0), Some(1.0));
            prop_assert!(!matches!(
                decide(&s),
                ScaleDecision::Up { reason: REASON_CPU_TEMPERATURE }
            ));
        }
    }
}
