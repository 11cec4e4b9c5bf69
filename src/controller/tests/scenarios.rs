// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! End-to-end scenarios for the monitor → evaluate → dispatch pipeline.

use fleet_controller::PassError;
use fleet_provider::InstanceSpec;
use fleet_registry::RegistryError;

use crate::util::{record, start, start_with_spec, HostMetrics, NOW_SECS};

pub mod util;

#[tokio::test]
async fn hot_cpu_replaces_the_host() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            cpu_temperature: Some(85.0),
            ..HostMetrics::nominal()
        },
    );

    let stats = fleet.manager.monitor_pass().await.unwrap();
    assert_eq!((stats.hosts, stats.scale_ups, stats.scale_downs), (1, 1, 0));
    assert_eq!(fleet.provider.creates_attempted(), 1);

    // The replacement is registered under its new generation name and the
    // old host is gone.
    let instances = fleet.provider.instances();
    assert_eq!(instances.len(), 1);
    let new = instances.values().next().unwrap();
    assert_eq!(new.workload, format!("web_{NOW_SECS}"));

    let replacement = fleet.registry.get(&new.address).await.unwrap();
    assert_eq!(replacement.workload, format!("web_{NOW_SECS}"));
    assert!(replacement.instance_id.is_some());
    assert!(matches!(
        fleet.registry.get("10.0.0.1").await,
        Err(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn hot_gpu_replaces_the_host() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("train", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            gpu_usage: Some(95.0),
            ..HostMetrics::nominal()
        },
    );

    let stats = fleet.manager.monitor_pass().await.unwrap();
    assert_eq!(stats.scale_ups, 1);
    assert_eq!(fleet.provider.creates_attempted(), 1);
    let instances = fleet.provider.instances();
    assert_eq!(
        instances.values().next().unwrap().workload,
        format!("train_{NOW_SECS}")
    );
}

#[tokio::test]
async fn idle_host_is_terminated() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-idle"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            cpu_temperature: Some(25.0),
            gpu_usage: Some(10.0),
            available_memory_mb: Some(8192.0),
            disk_latency: Some(1.0),
            ..HostMetrics::nominal()
        },
    );

    let stats = fleet.manager.monitor_pass().await.unwrap();
    assert_eq!((stats.scale_ups, stats.scale_downs), (0, 1));
    assert_eq!(fleet.provider.deleted(), vec![("i-idle".to_string(), None)]);
    assert!(matches!(
        fleet.registry.get("10.0.0.1").await,
        Err(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn replacement_region_follows_through_to_termination() {
    let fleet = start_with_spec(InstanceSpec {
        region: Some("us-east1-b".to_string()),
        ..Default::default()
    })
    .await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            cpu_temperature: Some(85.0),
            ..HostMetrics::nominal()
        },
    );

    // The replacement's record remembers where it was created.
    fleet.manager.monitor_pass().await.unwrap();
    let instances = fleet.provider.instances();
    let new_address = instances.values().next().unwrap().address.clone();
    let replacement = fleet.registry.get(&new_address).await.unwrap();
    assert_eq!(replacement.region.as_deref(), Some("us-east1-b"));

    // When the replacement later idles out, its termination targets the
    // creation region, not the adapter default.
    fleet.telemetry.set(
        &new_address,
        HostMetrics {
            cpu_temperature: Some(25.0),
            gpu_usage: Some(10.0),
            available_memory_mb: Some(8192.0),
            disk_latency: Some(1.0),
            ..HostMetrics::nominal()
        },
    );
    fleet.manager.monitor_pass().await.unwrap();
    assert_eq!(
        fleet.provider.deleted(),
        vec![("i-0001".to_string(), Some("us-east1-b".to_string()))]
    );
    assert!(matches!(
        fleet.registry.get(&new_address).await,
        Err(RegistryError::NotFound)
    ));
}

#[tokio::test]
async fn unknown_cpu_still_scales_on_page_faults() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            cpu_temperature: None,
            memory_page_faults: Some(1500.0),
            ..HostMetrics::nominal()
        },
    );

    let stats = fleet.manager.monitor_pass().await.unwrap();
    assert_eq!(stats.scale_ups, 1);
    assert_eq!(fleet.provider.creates_attempted(), 1);
}

#[tokio::test]
async fn all_metrics_unknown_does_nothing() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set("10.0.0.1", HostMetrics::default());

    let stats = fleet.manager.monitor_pass().await.unwrap();
    assert_eq!((stats.scale_ups, stats.scale_downs), (0, 0));
    assert_eq!(fleet.provider.creates_attempted(), 0);
    assert!(fleet.registry.get("10.0.0.1").await.is_ok());
}

#[tokio::test]
async fn leadership_lost_mid_pass_discards_intents() {
    let fleet = start().await;
    for address in ["10.0.0.1", "10.0.0.2"] {
        fleet
            .manager
            .register_node(address, record("web", "i-old"))
            .await
            .unwrap();
        fleet.telemetry.set(
            address,
            HostMetrics {
                cpu_temperature: Some(85.0),
                ..HostMetrics::nominal()
            },
        );
    }

    // Expire the session while telemetry is being gathered, before any
    // dispatch, and wait until the manager's handle has seen the loss.
    let coord = fleet.coord.clone();
    let session = fleet.session.clone();
    let mut leadership = fleet.leadership.clone();
    fleet.telemetry.on_next_fetch(move || async move {
        coord.expire(&session);
        leadership.lost().await;
    });

    let err = fleet.manager.monitor_pass().await.unwrap_err();
    assert!(matches!(err, PassError::LeadershipLost));
    // No provider writes were issued and nothing was re-registered.
    assert_eq!(fleet.provider.creates_attempted(), 0);
    assert!(fleet.registry.get("10.0.0.1").await.is_ok());
    assert!(fleet.registry.get("10.0.0.2").await.is_ok());
}

#[tokio::test]
async fn transient_create_failures_retry_to_one_replacement() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            cpu_temperature: Some(85.0),
            ..HostMetrics::nominal()
        },
    );
    fleet.provider.fail_creates(2);

    fleet.manager.monitor_pass().await.unwrap();
    // Two failures, one success: exactly one instance exists and exactly
    // one host is registered.
    assert_eq!(fleet.provider.creates_attempted(), 3);
    assert_eq!(fleet.provider.instances().len(), 1);
    let entries = fleet.registry.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.workload, format!("web_{NOW_SECS}"));
}

#[tokio::test]
async fn retry_budget_exhaustion_drops_the_intent() {
    let fleet = start().await;
    fleet
        .manager
        .register_node("10.0.0.1", record("web", "i-old"))
        .await
        .unwrap();
    fleet.telemetry.set(
        "10.0.0.1",
        HostMetrics {
            cpu_temperature: Some(85.0),
            ..HostMetrics::nominal()
        },
    );
    fleet.provider.fail_creates(10);

    // The pass completes; the intent burned its budget and was dropped.
    fleet.manager.monitor_pass().await.unwrap();
    assert_eq!(fleet.provider.creates_attempted(), 3);
    assert!(fleet.provider.instances().is_empty());
    // The overloaded host is untouched and will be reconsidered next pass.
    assert_eq!(fleet.registry.get("10.0.0.1").await.unwrap().workload, "web");
}

#[tokio::test]
async fn intents_dispatch_in_registry_traversal_order() {
    let fleet = start().await;
    for (address, workload) in [
        ("10.0.0.1", "alpha"),
        ("10.0.0.2", "beta"),
        ("10.0.0.3", "gamma"),
    ] {
        fleet
            .manager
            .register_node(address, record(workload, "i-old"))
            .await
            .unwrap();
        fleet.telemetry.set(
            address,
            HostMetrics {
                cpu_temperature: Some(85.0),
                ..HostMetrics::nominal()
            },
        );
    }

    let stats = fleet.manager.monitor_pass().await.unwrap();
    assert_eq!(stats.scale_ups, 3);
    // Synthetic instance ids are handed out sequentially, so dispatch order
    // is observable through them: hosts were replaced in registry order.
    let instances = fleet.provider.instances();
    let workload_of = |id: &str| instances[id].workload.clone();
    assert_eq!(workload_of("i-0001"), format!("alpha_{NOW_SECS}"));
    assert_eq!(workload_of("i-0002"), format!("beta_{NOW_SECS}"));
    assert_eq!(workload_of("i-0003"), format!("gamma_{NOW_SECS}"));
}

#[tokio::test]
async fn ranking_orders_hosts_by_load() {
    let fleet = start().await;
    for (address, cpu) in [("10.0.0.1", 70.0), ("10.0.0.2", 20.0)] {
        fleet
            .manager
            .register_node(address, record("web", "i-old"))
            .await
            .unwrap();
        fleet.telemetry.set(
            address,
            HostMetrics {
                cpu_temperature: Some(cpu),
                ..HostMetrics::nominal()
            },
        );
    }

    let stats = fleet.manager.monitor_pass().await.unwrap();
    let ranked: Vec<_> = stats.ranking.iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(ranked, vec!["10.0.0.2", "10.0.0.1"]);
}
