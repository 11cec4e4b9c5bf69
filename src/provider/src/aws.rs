// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The AWS adapter, on the native EC2 SDK.

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{InstanceType, ResourceType, Tag, TagSpecification};
use tracing::info;

use crate::{CloudProvider, CreatedInstance, InstanceSpec, ProviderAdapter, ProviderError};

const DEFAULT_IMAGE: &str = "ami-0abcdef1234567890";
const DEFAULT_INSTANCE_TYPE: &str = "t2.micro";

/// Provisions EC2 instances. Credentials come from the default AWS
/// credential chain (environment, profile, instance metadata).
#[derive(Debug, Default, Clone)]
pub struct AwsProvider {
    region: Option<String>,
}

impl AwsProvider {
    /// Creates an adapter using the credential chain's default region.
    pub fn new() -> AwsProvider {
        AwsProvider::default()
    }

    /// Creates an adapter pinned to a region.
    pub fn with_region(region: &str) -> AwsProvider {
        AwsProvider {
            region: Some(region.to_string()),
        }
    }

    // SDK handles are created per call rather than shared across the
    // controller (§ concurrency model: provider handles are not shared
    // state).
    async fn client(&self, spec_region: Option<&str>) -> aws_sdk_ec2::Client {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = spec_region.or(self.region.as_deref()) {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        aws_sdk_ec2::Client::new(&loader.load().await)
    }
}

#[async_trait]
impl ProviderAdapter for AwsProvider {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Aws
    }

    async fn create_instance(
        &self,
        workload: &str,
        spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError> {
        let client = self.client(spec.region.as_deref()).await;
        let image = spec.image.as_deref().unwrap_or(DEFAULT_IMAGE);
        let instance_type = spec.machine_type.as_deref().unwrap_or(DEFAULT_INSTANCE_TYPE);

        let run = client
            .run_instances()
            .image_id(image)
            .instance_type(InstanceType::from(instance_type))
            .min_count(1)
            .max_count(1)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(Tag::builder().key("workload").value(workload).build())
                    .build(),
            )
            .send()
            .await
            .map_err(classify)?;

        let instance = run
            .instances()
            .first()
            .ok_or_else(|| ProviderError::Fatal(anyhow!("RunInstances returned no instances")))?;
        let instance_id = instance
            .instance_id()
            .ok_or_else(|| ProviderError::Fatal(anyhow!("instance has no id")))?
            .to_string();
        let address = instance
            .private_ip_address()
            .or_else(|| instance.public_ip_address())
            .ok_or_else(|| ProviderError::Fatal(anyhow!("instance {instance_id} has no address")))?
            .to_string();

        info!("started EC2 instance {instance_id} at {address} for {workload}");
        Ok(CreatedInstance {
            instance_id,
            address,
        })
    }

    async fn delete_instance(
        &self,
        instance_id: &str,
        region: Option<&str>,
    ) -> Result<(), ProviderError> {
        let client = self.client(region).await;
        match client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(_) => {
                info!("terminated EC2 instance {instance_id}");
                Ok(())
            }
            // Already gone; termination is idempotent.
            Err(SdkError::ServiceError(ctx))
                if ctx.err().meta().code() == Some("InvalidInstanceID.NotFound") =>
            {
                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }
}

fn classify<E>(err: SdkError<E>) -> ProviderError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16() >= 500,
        _ => false,
    };
    if transient {
        ProviderError::Transient(anyhow::Error::new(err))
    } else {
        ProviderError::Fatal(anyhow::Error::new(err))
    }
}
