// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Load ranking for placement hints.
//!
//! Each host's load is collapsed to a single scalar so that placement
//! decisions (which host to shed from first, where new work lands) can use
//! a simple sorted order. The scalar sums the four families that track
//! activity; page faults are rescaled so a count in the thousands does not
//! drown out everything else. Unknown metrics contribute nothing.

use fleet_telemetry::TelemetrySnapshot;

/// Divisor applied to the page-fault count before it joins the sum.
const PAGE_FAULT_SCALE: f64 = 100.0;

/// Collapses one snapshot to a load scalar.
pub fn node_load(snapshot: &TelemetrySnapshot, interface: &str) -> f64 {
    snapshot.cpu_temperature.unwrap_or(0.0)
        + snapshot.memory_page_faults.unwrap_or(0.0) / PAGE_FAULT_SCALE
        + snapshot.network_bandwidth(interface).unwrap_or(0.0)
        + snapshot.gpu_usage().unwrap_or(0.0)
}

/// Ranks hosts by load, least loaded first. Ties break toward the
/// lexicographically smaller address so the ranking is total.
pub fn rank_hosts(
    hosts: impl IntoIterator<Item = (String, TelemetrySnapshot)>,
    interface: &str,
) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = hosts
        .into_iter()
        .map(|(address, snapshot)| {
            let load = node_load(&snapshot, interface);
            (address, load)
        })
        .collect();
    ranked.sort_by(|(a_addr, a_load), (b_addr, b_load)| {
        a_load
            .total_cmp(b_load)
            .then_with(|| a_addr.cmp(b_addr))
    });
    ranked
}
