// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Shared plumbing for the HTTP-speaking adapters.

use anyhow::anyhow;
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::ProviderError;

/// Reads a required configuration value (token, project, subscription) from
/// the environment.
pub(crate) fn required_env(var: &str) -> Result<String, ProviderError> {
    std::env::var(var).map_err(|_| ProviderError::Fatal(anyhow!("{var} is not set")))
}

/// Sends a request and classifies the outcome.
///
/// Connection-level failures and 5xx responses are transient; 4xx responses
/// are fatal. The successful response is returned for the caller to parse.
pub(crate) async fn execute(request: RequestBuilder) -> Result<Response, ProviderError> {
    let response = request.send().await.map_err(|e| {
        // Everything below the HTTP layer (DNS, connect, reset, timeout) is
        // worth retrying.
        ProviderError::Transient(anyhow::Error::new(e))
    })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = anyhow!("provider returned {status}: {body}");
    if status.is_server_error() {
        Err(ProviderError::Transient(err))
    } else {
        Err(ProviderError::Fatal(err))
    }
}

/// Like [`execute`], but treats 404 as success. Used by deletes, which must
/// be idempotent: an instance that is already gone is deleted.
pub(crate) async fn execute_delete(request: RequestBuilder) -> Result<(), ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::Transient(anyhow::Error::new(e)))?;
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let err = anyhow!("provider returned {status}: {body}");
    if status.is_server_error() {
        Err(ProviderError::Transient(err))
    } else {
        Err(ProviderError::Fatal(err))
    }
}
