// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Platform Infrastructure Module
//!
//! Concrete implementations of the `PlatformDriver` trait. The driver is
//! chosen once at startup from `spec.platform.kind`; nothing downstream
//! branches on the platform.

pub mod docker;
pub mod kubernetes;
pub mod mock;
pub mod probe;

pub use docker::DockerDriver;
pub use kubernetes::KubernetesDriver;
pub use probe::{Backoff, HealthProbe, ProbeOutcome};

// Re-export MockPlatformDriver for testing
pub use mock::{MockFailure, MockPlatformDriver};

use std::sync::Arc;
use anyhow::Context;
use crate::domain::container::Platform;
use crate::domain::node_config::FleetConfigSpec;
use crate::domain::platform::PlatformDriver;

/// Shared HTTP client for runtime calls (probes, KIE REST)
pub fn build_runtime_client(spec: &FleetConfigSpec) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(spec.deployment.request_timeout)
        .build()
        .context("Failed to build runtime HTTP client")
}

/// Factory function to create the platform driver from configuration
pub fn create_platform_driver(
    spec: &FleetConfigSpec,
    client: reqwest::Client,
) -> anyhow::Result<Arc<dyn PlatformDriver>> {
    let probe = HealthProbe::new(client, &spec.runtime, &spec.deployment);
    let credentials = [
        ("KIE_SERVER_USER".to_string(), spec.runtime.username.clone()),
        ("KIE_SERVER_PWD".to_string(), spec.runtime.password.clone()),
    ];

    match spec.platform.kind {
        Platform::Local => {
            let env = credentials.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            let driver = DockerDriver::new(
                spec.platform.docker.clone(),
                probe,
                spec.deployment.create_timeout,
                env,
            )
            .context("Failed to initialize Docker driver")?;
            tracing::info!(network = %spec.platform.docker.network, "Using local Docker platform");
            Ok(Arc::new(driver))
        }
        Platform::Cluster => {
            let driver = KubernetesDriver::new(
                spec.platform.cluster.clone(),
                probe,
                spec.deployment.create_timeout,
                spec.deployment.request_timeout,
                credentials.to_vec(),
            )
            .context("Failed to initialize Kubernetes driver")?;
            tracing::info!(
                api = %spec.platform.cluster.api_url,
                namespace = %spec.platform.cluster.namespace,
                "Using Kubernetes cluster platform"
            );
            Ok(Arc::new(driver))
        }
    }
}
