// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The GCP adapter, on the Compute Engine instances surface.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::http::{required_env, execute, execute_delete};
use crate::{CloudProvider, CreatedInstance, InstanceSpec, ProviderAdapter, ProviderError};

const API_BASE: &str = "https://compute.googleapis.com/compute/v1";
const TOKEN_VAR: &str = "GCP_ACCESS_TOKEN";
const PROJECT_VAR: &str = "GCP_PROJECT";

const DEFAULT_ZONE: &str = "us-central1-a";
const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";
const DEFAULT_IMAGE: &str = "projects/debian-cloud/global/images/family/debian-10";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    name: String,
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(rename = "networkIP")]
    network_ip: Option<String>,
}

/// Provisions Compute Engine instances.
#[derive(Debug, Clone)]
pub struct GcpProvider {
    client: reqwest::Client,
    api_base: String,
}

impl Default for GcpProvider {
    fn default() -> Self {
        GcpProvider::new()
    }
}

impl GcpProvider {
    /// Creates an adapter against the public Compute Engine endpoint.
    pub fn new() -> GcpProvider {
        GcpProvider {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    /// Creates an adapter against a different endpoint. For tests.
    pub fn with_api_base(api_base: &str) -> GcpProvider {
        GcpProvider {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
        }
    }

    fn zone_url(&self, project: &str, zone: &str) -> String {
        format!("{}/projects/{project}/zones/{zone}", self.api_base)
    }
}

#[async_trait]
impl ProviderAdapter for GcpProvider {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Gcp
    }

    async fn create_instance(
        &self,
        workload: &str,
        spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        let project = required_env(PROJECT_VAR)?;
        let zone = spec.region.as_deref().unwrap_or(DEFAULT_ZONE);
        let machine_type = spec.machine_type.as_deref().unwrap_or(DEFAULT_MACHINE_TYPE);
        let body = json!({
            "name": workload,
            "machineType": format!("zones/{zone}/machineTypes/{machine_type}"),
            "disks": [{
                "boot": true,
                "initializeParams": {
                    "sourceImage": spec.image.as_deref().unwrap_or(DEFAULT_IMAGE),
                },
            }],
            "networkInterfaces": [{ "network": "global/networks/default" }],
        });

        execute(
            self.client
                .post(format!("{}/instances", self.zone_url(&project, zone)))
                .bearer_auth(&token)
                .json(&body),
        )
        .await?;

        // Insert returns an operation; the assigned address lives on the
        // instance resource.
        let response = execute(
            self.client
                .get(format!("{}/instances/{workload}", self.zone_url(&project, zone)))
                .bearer_auth(&token),
        )
        .await?;
        let instance: Instance = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(anyhow!("malformed instance response: {e}")))?;
        let address = instance
            .network_interfaces
            .first()
            .and_then(|nic| nic.network_ip.clone())
            .ok_or_else(|| {
                ProviderError::Fatal(anyhow!("instance {} has no address", instance.name))
            })?;

        info!("started GCE instance {} at {address} for {workload}", instance.name);
        Ok(CreatedInstance {
            instance_id: instance.name,
            address,
        })
    }

    async fn delete_instance(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<(), ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        let project = required_env(PROJECT_VAR)?;
        // Deletes are zone-scoped; targeting the wrong zone would 404 and
        // read as an already-deleted instance.
        let zone = region.unwrap_or(DEFAULT_ZONE);
        execute_delete(
            self.client
                .delete(format!(
                    "{}/instances/{instance_id}",
                    self.zone_url(&project, zone)
                ))
                .bearer_auth(token),
        )
        .await?;
        info!("deleted GCE instance {instance_id}");
        Ok(())
    }
}
