// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Paperspace adapter, on the machines HTTPS API.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::http::{required_env, execute, execute_delete};
use crate::{CloudProvider, CreatedInstance, InstanceSpec, ProviderAdapter, ProviderError};

const API_BASE: &str = "https://api.paperspace.io";
const TOKEN_VAR: &str = "PAPERSPACE_API_KEY";

const DEFAULT_REGION: &str = "East Coast (NY2)";
const DEFAULT_MACHINE_TYPE: &str = "C1";
const DEFAULT_DISK_GB: u32 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Machine {
    id: String,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
}

/// Provisions Paperspace machines.
#[derive(Debug, Clone)]
pub struct PaperspaceProvider {
    client: reqwest::Client,
    api_base: String,
}

impl Default for PaperspaceProvider {
    fn default() -> Self {
        PaperspaceProvider::new()
    }
}

impl PaperspaceProvider {
    /// Creates an adapter against the public API endpoint.
    pub fn new() -> PaperspaceProvider {
        PaperspaceProvider {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    /// Creates an adapter against a different endpoint. For tests.
    pub fn with_api_base(api_base: &str) -> PaperspaceProvider {
        PaperspaceProvider {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for PaperspaceProvider {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Paperspace
    }

    async fn create_instance(
        &self,
        workload: &str,
        spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        let template = spec.image.as_deref().ok_or_else(|| {
            ProviderError::Fatal(anyhow!("paperspace requires a template id in the instance spec"))
        })?;
        let body = json!({
            "region": spec.region.as_deref().unwrap_or(DEFAULT_REGION),
            "machineType": spec.machine_type.as_deref().unwrap_or(DEFAULT_MACHINE_TYPE),
            "size": spec.disk_size_gb.unwrap_or(DEFAULT_DISK_GB),
            "billingType": "hourly",
            "machineName": workload,
            "templateId": template,
        });

        let response = execute(
            self.client
                .post(format!("{}/machines/createSingleMachinePublic", self.api_base))
                .bearer_auth(token)
                .json(&body),
        )
        .await?;
        let machine: Machine = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(anyhow!("malformed machine response: {e}")))?;

        let address = machine
            .public_ip_address
            .or(machine.private_ip_address)
            .ok_or_else(|| {
                ProviderError::Fatal(anyhow!("machine {} has no address", machine.id))
            })?;
        info!("started Paperspace machine {} at {address} for {workload}", machine.id);
        Ok(CreatedInstance {
            instance_id: machine.id,
            address,
        })
    }

    // Machine ids are account-global; the region is not part of the delete
    // surface.
    async fn delete_instance(
        &self,
        instance_id: &str,
        _region: Option<&str>,
    ) -> Result<(), ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        execute_delete(
            self.client
                .post(format!("{}/machines/{instance_id}/destroyMachine", self.api_base))
                .bearer_auth(token),
        )
        .await?;
        info!("destroyed Paperspace machine {instance_id}");
        Ok(())
    }
}
