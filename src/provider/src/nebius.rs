// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The Nebius adapter, on the instances HTTPS API.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::http::{required_env, execute, execute_delete};
use crate::{CloudProvider, CreatedInstance, InstanceSpec, ProviderAdapter, ProviderError};

const API_BASE: &str = "https://api.nebius.ai";
const TOKEN_VAR: &str = "NEBIUS_API_KEY";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    id: String,
    ip_address: Option<String>,
}

/// Provisions Nebius instances.
#[derive(Debug, Clone)]
pub struct NebiusProvider {
    client: reqwest::Client,
    api_base: String,
}

impl Default for NebiusProvider {
    fn default() -> Self {
        NebiusProvider::new()
    }
}

impl NebiusProvider {
    /// Creates an adapter against the public API endpoint.
    pub fn new() -> NebiusProvider {
        NebiusProvider {
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    /// Creates an adapter against a different endpoint. For tests.
    pub fn with_api_base(api_base: &str) -> NebiusProvider {
        NebiusProvider {
            client: reqwest::Client::new(),
            api_base: api_base.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for NebiusProvider {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Nebius
    }

    async fn create_instance(
        &self,
        workload: &str,
        spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        let mut body = json!({ "name": workload });
        if let Some(region) = &spec.region {
            body["region"] = json!(region);
        }
        if let Some(machine_type) = &spec.machine_type {
            body["instanceType"] = json!(machine_type);
        }
        if let Some(image) = &spec.image {
            body["imageId"] = json!(image);
        }

        let response = execute(
            self.client
                .post(format!("{}/v1/instances", self.api_base))
                .bearer_auth(token)
                .json(&body),
        )
        .await?;
        let instance: Instance = response
            .json()
            .await
            .map_err(|e| ProviderError::Fatal(anyhow!("malformed instance response: {e}")))?;

        let address = instance.ip_address.ok_or_else(|| {
            ProviderError::Fatal(anyhow!("instance {} has no address", instance.id))
        })?;
        info!("started Nebius instance {} at {address} for {workload}", instance.id);
        Ok(CreatedInstance {
            instance_id: instance.id,
            address,
        })
    }

    // Instance ids are account-global; the region is not part of the delete
    // surface.
    async fn delete_instance(
        &self,
        instance_id: &str,
        _region: Option<&str>,
    ) -> Result<(), ProviderError> {
        let token = required_env(TOKEN_VAR)?;
        execute_delete(
            self.client
                .delete(format!("{}/v1/instances/{instance_id}", self.api_base))
                .bearer_auth(token),
        )
        .await?;
        info!("deleted Nebius instance {instance_id}");
        Ok(())
    }
}
