// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Azure adapter, on the Resource Manager virtual-machines surface.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::http::{required_env, execute, execute_delete};
use crate::{CloudProvider, CreatedInstance, InstanceSpec, ProviderAdapter, ProviderError};

const API_BASE: &str = "https://management.azure.com";
const API_VERSION: &str = "2023-03-01";
const TOKEN_VAR: &str = "AZURE_MGMT_TOKEN";
const SUBSCRIPTION_VAR: &str = "AZURE_SUBSCRIPTION_ID";
const RESOURCE_GROUP_VAR: &str = "AZURE_RESOURCE_GROUP";
const ADMIN_PASSWORD_VAR: &str = "AZURE_ADMIN_PASSWORD";

const DEFAULT_LOCATION: &str = "eastus";
const DEFAULT_VM_SIZE: &str = "Standard_DS1_v2";

#[derive(Debug, Deserialize)]
struct VirtualMachine {
    name: String,
}

/// Provisions Azure virtual machines through the Resource Manager API.
#[derive(Debug, Clone)]
pub struct AzureProvider {
    client: reqwest::Client,
    api_base: String,
}

impl Default for AzureProvider {
    fn default() -> Self {
        AzureProvider::new()
    }
}

impl AzureProvider {
    /// Creates an adapter against the public Resource Manager endpoint.
    pub fn new() -> AzureProvider {
        AzureProvider {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    /// Creates an adapter against a different endpoint. For tests.
    pub fn with_api_base(api_base: &str) -> AzureProvider {
        AzureProvider {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
        }
    }

    fn vm_url(&self, name: &str) -> Result<String, ProviderError> {
        let subscription = required_env(SUBSCRIPTION_VAR)?;
        let resource_group = required_env(RESOURCE_GROUP_VAR)?;
        Ok(format!(
            "{}/subscriptions/{subscription}/resourceGroups/{resource_group}\
             /providers/Microsoft.Compute/virtualMachines/{name}?api-version={API_VERSION}",
            self.api_base
        ))
    }
}

#[async_trait]
impl ProviderAdapter for AzureProvider {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Azure
    }

    async fn create_instance(
        &self,
        workload: &str,
        spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        let admin_password = required_env(ADMIN_PASSWORD_VAR)?;
        let location = spec.region.as_deref().unwrap_or(DEFAULT_LOCATION);
        let body = json!({
            "location": location,
            "properties": {
                "hardwareProfile": {
                    "vmSize": spec.machine_type.as_deref().unwrap_or(DEFAULT_VM_SIZE),
                },
                "storageProfile": {
                    "imageReference": {
                        "publisher": "Canonical",
                        "offer": "UbuntuServer",
                        "sku": spec.image.as_deref().unwrap_or("18.04-LTS"),
                        "version": "latest",
                    },
                },
                "osProfile": {
                    "computerName": workload,
                    "adminUsername": "fleet",
                    "adminPassword": admin_password,
                },
            },
        });

        let response = execute(
            self.client
                .put(self.vm_url(workload)?)
                .bearer_auth(token)
                .json(&body),
        )
        .await?;
        let vm: VirtualMachine = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(anyhow!("malformed virtual machine response: {e}")))?;

        // The VM resource carries no IP; addresses live on the NIC. The
        // deterministic cloudapp hostname resolves to the machine once it is
        // up.
        let address = format!("{}.{location}.cloudapp.azure.com", vm.name);
        info!("started Azure VM {} at {address} for {workload}", vm.name);
        Ok(CreatedInstance {
            instance_id: vm.name,
            address,
        })
    }

    // VM names are unique within the resource group, so the creation
    // location plays no part in deletion.
    async fn delete_instance(
        &self,
        instance_id: &str,
        _region: Option<&str>,
    ) -> Result<(), ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        execute_delete(self.client.delete(self.vm_url(instance_id)?).bearer_auth(token)).await?;
        info!("deleted Azure VM {instance_id}");
        Ok(())
    }
}
