// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process provider.
//!
//! [`MemoryProvider`] hands out synthetic instances instead of calling a
//! cloud API. Single-node and development deployments run against it, and
//! the test suite uses its failure injection to exercise the controller's
//! retry discipline.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::{CloudProvider, CreatedInstance, InstanceSpec, ProviderAdapter, ProviderError};

#[derive(Debug, Default)]
struct MemState {
    next: u64,
    instances: BTreeMap<String, SyntheticInstance>,
    deleted: Vec<(String, Option<String>)>,
    create_failures: u64,
    creates_attempted: u64,
}

/// One synthetic instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticInstance {
    /// The workload the instance was created for.
    pub workload: String,
    /// The synthetic address handed out at creation.
    pub address: String,
}

/// A provider that provisions instances out of thin air.
#[derive(Debug)]
pub struct MemoryProvider {
    impersonates: CloudProvider,
    state: Mutex<MemState>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        MemoryProvider::new(CloudProvider::Aws)
    }
}

impl MemoryProvider {
    /// Creates a provider that reports driving `impersonates`.
    pub fn new(impersonates: CloudProvider) -> MemoryProvider {
        MemoryProvider {
            impersonates,
            state: Mutex::new(MemState::default()),
        }
    }

    /// Makes the next `n` creates fail with a transient error.
    pub fn fail_creates(&self, n: u64) {
        self.state.lock().expect("lock poisoned").create_failures = n;
    }

    /// The live synthetic instances, keyed by instance id.
    pub fn instances(&self) -> BTreeMap<String, SyntheticInstance> {
        self.state.lock().expect("lock poisoned").instances.clone()
    }

    /// The deletions issued so far, in order: the instance id and the
    /// region the caller handed back.
    pub fn deleted(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().expect("lock poisoned").deleted.clone()
    }

    /// How many creates were attempted, including failed ones.
    pub fn creates_attempted(&self) -> u64 {
        self.state.lock().expect("lock poisoned").creates_attempted
    }
}

#[async_trait]
impl ProviderAdapter for MemoryProvider {
    fn provider(&self) -> CloudProvider {
        self.impersonates
    }

    async fn create_instance(
        &self,
        workload: &str,
        _spec: &InstanceSpec,
    ) -> Result<CreatedInstance, ProviderError> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.creates_attempted += 1;
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(ProviderError::Transient(anyhow::anyhow!(
                "injected create failure"
            )));
        }
        state.next += 1;
        let instance_id = format!("i-{:04}", state.next);
        let address = format!("10.1.0.{}", state.next);
        state.instances.insert(
            instance_id.clone(),
            SyntheticInstance {
                workload: workload.to_string(),
                address: address.clone(),
            },
        );
        info!("started synthetic instance {instance_id} at {address} for {workload}");
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
        let mut state = self.state.lock().expect("lock poisoned");
        // Deleting an unknown id is fine; deletes are idempotent.
        state.instances.remove(instance_id);
        state
            .deleted
            .push((instance_id.to_string(), region.map(str::to_string)));
        Ok(())
    }
}
