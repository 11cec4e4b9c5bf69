// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Uniform instance provisioning over heterogeneous cloud APIs.
//!
//! The controller scales workloads by creating and terminating instances,
//! and it does so exclusively through the [`ProviderAdapter`] trait: one
//! implementation per cloud, all presenting the same two operations. The
//! adapter returns the new instance's identity — both the provider-assigned
//! instance id and the address the fleet will reach it at — in its result;
//! nothing about the new host is communicated out of band.
//!
//! Adapters authenticate from the environment (credential files for AWS,
//! bearer tokens for the HTTP providers); the shape of those credentials is
//! not this crate's concern.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod aws;
pub mod azure;
pub mod gcp;
mod http;
pub mod mem;
pub mod nebius;
pub mod paperspace;

pub use mem::MemoryProvider;

/// The default per-call provider deadline. Provider calls are slow — they
/// provision real machines — so this is far larger than the telemetry
/// deadline.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// The clouds the fleet can span.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Paperspace,
    Nebius,
    Azure,
    Gcp,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Paperspace => "paperspace",
            CloudProvider::Nebius => "nebius",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

impl FromStr for CloudProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "paperspace" => Ok(CloudProvider::Paperspace),
            "nebius" => Ok(CloudProvider::Nebius),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" => Ok(CloudProvider::Gcp),
            other => Err(anyhow::anyhow!("unknown cloud provider: {other}")),
        }
    }
}

/// An error produced by a provider adapter.
#[derive(Debug)]
pub enum ProviderError {
    /// The operation may succeed if retried: connection failures, timeouts,
    /// and provider-side (5xx) errors.
    Transient(anyhow::Error),
    /// Retrying cannot help: the request itself is wrong (4xx), or the
    /// environment is misconfigured.
    Fatal(anyhow::Error),
}

impl ProviderError {
    /// Reports whether a retry is warranted.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProviderError::Transient(e) => write!(f, "transient provider error: {e:#}"),
            ProviderError::Fatal(e) => write!(f, "fatal provider error: {e:#}"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// The identity of a freshly created instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    /// The opaque id the provider knows the instance by. Required for
    /// termination.
    pub instance_id: String,
    /// The address the fleet reaches the instance at.
    pub address: String,
}

/// Shape of the instance to create. Unset fields fall back to per-provider
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Region or zone, in the provider's own vocabulary.
    pub region: Option<String>,
    /// Machine type / size, in the provider's own vocabulary.
    pub machine_type: Option<String>,
    /// Boot image, template id, or image family.
    pub image: Option<String>,
    /// Boot disk size in GB, where the provider wants one.
    pub disk_size_gb: Option<u32>,
}

/// One cloud's create/delete surface.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which cloud this adapter drives.
    fn provider(&self) -> CloudProvider;

    /// Creates an instance for the named workload, returning its identity.
    async fn create_instance(
        &self,
        workload: &str,
        spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError>;

    /// Terminates an instance. Deleting an id the provider no longer knows
    /// is not an error.
    ///
    /// `region` is the region or zone the instance was created in. Adapters
    /// whose delete surface is region-scoped (AWS, GCP) must be handed the
    /// creation region back, or they would look for the instance in the
    /// default region and mistake it for already deleted; the others ignore
    /// it. `None` means the adapter default.
    async fn delete_instance(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<(), ProviderError>;
}

/// The set of configured adapters, one per cloud the deployment spans.
#[derive(Clone, Default)]
pub struct Providers {
    adapters: BTreeMap<CloudProvider, Arc<dyn ProviderAdapter>>,
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Providers")
            .field("configured", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Providers {
    /// Creates an empty set.
    pub fn new() -> Providers {
        Providers::default()
    }

    /// Adds an adapter, keyed by the cloud it reports driving.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> &mut Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Returns the adapter for `provider`, if configured.
    pub fn get(&self, provider: CloudProvider) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider).map(Arc::clone)
    }
}
