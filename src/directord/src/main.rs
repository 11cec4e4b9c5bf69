// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The `directord` binary.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fleet_controller::{NodeManagerConfig, Thresholds};
use fleet_coord::MemoryCoordination;
use fleet_directord::{Director, DirectorConfig, DEFAULT_MONITOR_INTERVAL, DEFAULT_SHARD_COUNT};
use fleet_provider::{
    aws::AwsProvider, azure::AzureProvider, gcp::GcpProvider, nebius::NebiusProvider,
    paperspace::PaperspaceProvider, CloudProvider, MemoryProvider, Providers,
};
use fleet_telemetry::{TelemetryClient, TelemetryError};

/// The multi-cloud node-fleet controller.
#[derive(Parser, Debug)]
#[clap(name = "directord")]
struct Args {
    /// The address this controller advertises in the leader entry.
    #[clap(long, env = "DIRECTORD_ADDRESS", default_value = "127.0.0.1")]
    address: String,

    /// The path of the leader entry in the coordination service.
    #[clap(long, env = "DIRECTORD_LEADER_PATH", default_value = "/director/leader")]
    leader_path: String,

    /// Seconds between monitor passes.
    #[clap(long, env = "DIRECTORD_MONITOR_INTERVAL", default_value_t = DEFAULT_MONITOR_INTERVAL.as_secs())]
    monitor_interval: u64,

    /// The per-call telemetry deadline, in seconds.
    #[clap(long, env = "DIRECTORD_TELEMETRY_TIMEOUT", default_value_t = 5)]
    telemetry_timeout: u64,

    /// The per-call provider deadline, in seconds.
    #[clap(long, env = "DIRECTORD_PROVIDER_TIMEOUT", default_value_t = 60)]
    provider_timeout: u64,

    /// How many registry shards to run.
    #[clap(long, env = "DIRECTORD_SHARD_COUNT", default_value_t = DEFAULT_SHARD_COUNT)]
    shard_count: usize,

    /// Where the registry persists across restarts. Ephemeral if unset.
    #[clap(long, env = "DIRECTORD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// The interface whose bandwidth feeds the scaling policy.
    #[clap(long, env = "DIRECTORD_PRIMARY_INTERFACE", default_value = "eth0")]
    primary_interface: String,

    /// The disk device whose latency feeds the scaling policy.
    #[clap(long, env = "DIRECTORD_PRIMARY_DISK", default_value = "/dev/sda")]
    primary_disk: String,

    /// Provision synthetic in-process instances instead of calling cloud
    /// APIs. For development.
    #[clap(long)]
    synthetic: bool,

    /// Scale up above this CPU temperature, in °C.
    #[clap(long, env = "DIRECTORD_THRESHOLD_CPU_TEMPERATURE")]
    threshold_cpu_temperature: Option<f64>,

    /// Scale up above this many page faults.
    #[clap(long, env = "DIRECTORD_THRESHOLD_MEMORY_PAGE_FAULTS")]
    threshold_memory_page_faults: Option<f64>,

    /// Scale up above this bandwidth on the primary interface, in MB/s.
    #[clap(long, env = "DIRECTORD_THRESHOLD_NETWORK_BANDWIDTH")]
    threshold_network_bandwidth: Option<f64>,

    /// Scale up above this GPU usage, in percent.
    #[clap(long, env = "DIRECTORD_THRESHOLD_GPU_USAGE")]
    threshold_gpu_usage: Option<f64>,

    /// Scale up below this much available memory, in MB.
    #[clap(long, env = "DIRECTORD_THRESHOLD_AVAILABLE_MEMORY")]
    threshold_available_memory: Option<f64>,

    /// Scale up above this disk latency, in milliseconds.
    #[clap(long, env = "DIRECTORD_THRESHOLD_DISK_LATENCY")]
    threshold_disk_latency: Option<f64>,
}

impl Args {
    fn thresholds(&self) -> Thresholds {
        let mut thresholds = Thresholds::default();
        if let Some(v) = self.threshold_cpu_temperature {
            thresholds.cpu_temperature_max = v;
        }
        if let Some(v) = self.threshold_memory_page_faults {
            thresholds.memory_page_faults_max = v;
        }
        if let Some(v) = self.threshold_network_bandwidth {
            thresholds.network_bandwidth_max_mbps = v;
        }
        if let Some(v) = self.threshold_gpu_usage {
            thresholds.gpu_usage_max = v;
        }
        if let Some(v) = self.threshold_available_memory {
            thresholds.available_memory_min_mb = v;
        }
        if let Some(v) = self.threshold_disk_latency {
            thresholds.disk_latency_max_ms = v;
        }
        thresholds
    }
}

/// A telemetry client for deployments that have not wired a metric
/// transport yet. Every metric reads as unknown, which the policy treats as
/// "take no action", so a bare controller idles safely.
#[derive(Debug, Clone, Copy, Default)]
struct UnwiredTelemetry;

#[async_trait]
impl TelemetryClient for UnwiredTelemetry {
    async fn cpu_temperature(&self, _: &str) -> Result<f64, TelemetryError> {
        Err(TelemetryError::Unavailable(anyhow::anyhow!(
            "no metric transport configured"
        )))
    }

    async fn memory_page_faults(&self, _: &str) -> Result<f64, TelemetryError> {
        Err(TelemetryError::Unavailable(anyhow::anyhow!(
            "no metric transport configured"
        )))
    }

    async fn available_memory_mb(&self, _: &str) -> Result<f64, TelemetryError> {
        Err(TelemetryError::Unavailable(anyhow::anyhow!(
            "no metric transport configured"
        )))
    }

    async fn network_bandwidth_utilization(&self, _: &str, _: &str) -> Result<f64, TelemetryError> {
        Err(TelemetryError::Unavailable(anyhow::anyhow!(
            "no metric transport configured"
        )))
    }

    async fn disk_latency(&self, _: &str, _: &str) -> Result<f64, TelemetryError> {
        Err(TelemetryError::Unavailable(anyhow::anyhow!(
            "no metric transport configured"
        )))
    }

    async fn gpu_metrics(&self, _: &str, _: u32) -> Result<BTreeMap<String, f64>, TelemetryError> {
        Err(TelemetryError::Unavailable(anyhow::anyhow!(
            "no metric transport configured"
        )))
    }
}

fn providers(args: &Args) -> Providers {
    let mut providers = Providers::new();
    if args.synthetic {
        providers.register(Arc::new(MemoryProvider::new(CloudProvider::Aws)));
        return providers;
    }
    providers.register(Arc::new(AwsProvider::new()));
    providers.register(Arc::new(PaperspaceProvider::new()));
    providers.register(Arc::new(NebiusProvider::new()));
    providers.register(Arc::new(AzureProvider::new()));
    providers.register(Arc::new(GcpProvider::new()));
    providers
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    // The coordination deployment binding is environment glue; out of the
    // box the director elects through the in-process service, which is the
    // single-controller configuration.
    let coordination = MemoryCoordination::new();
    let session = coordination.session();

    let mut manager = NodeManagerConfig::new(Arc::new(UnwiredTelemetry), providers(&args));
    manager.thresholds = args.thresholds();
    manager.collect.timeout = Duration::from_secs(args.telemetry_timeout);
    manager.collect.interface = args.primary_interface.clone();
    manager.collect.disk = args.primary_disk.clone();
    manager.provider_timeout = Duration::from_secs(args.provider_timeout);

    let director = Director::initialize(DirectorConfig {
        address: args.address.clone(),
        coordination: Arc::new(session),
        leader_path: args.leader_path.clone(),
        monitor_interval: Duration::from_secs(args.monitor_interval),
        shard_count: args.shard_count,
        data_dir: args.data_dir.clone(),
        manager,
    })
    .await?;

    director
        .node_controller(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received interrupt");
        })
        .await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("directord: fatal: {e:#}");
        process::exit(1);
    }
}
