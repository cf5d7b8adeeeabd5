// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Platform driver port.
//!
//! One trait covers every backend that can host a rule runtime environment.
//! The orchestrator and the port allocator only ever see this trait; the
//! concrete driver is picked from configuration at startup.

use crate::domain::container::{ContainerId, HealthStatus, Platform};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to provision for a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    pub container_id: ContainerId,
    pub port: u16,
}

/// A provisioned environment as reported by `create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub container_id: ContainerId,
    /// Platform-level name (container name, deployment name)
    pub name: String,
    pub endpoint: String,
    pub port: u16,
}

/// An environment observed on the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEnvironment {
    pub name: String,
    /// None for environments whose labels could not be read back
    pub container_id: Option<ContainerId>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Bytes,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait PlatformDriver: Send + Sync {
    fn platform(&self) -> Platform;

    /// Provision (or return the already present) environment for a container.
    ///
    /// Returns only once the runtime inside answers its health endpoint.
    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, PlatformError>;

    /// Remove the environment. Absent environments are not an error.
    async fn delete(&self, container_id: &ContainerId) -> Result<(), PlatformError>;

    /// Probe the runtime health endpoint. Unreachable reads as unhealthy.
    async fn health_check(&self, endpoint: &str) -> HealthStatus;

    /// Every environment this system manages on the platform.
    async fn list(&self) -> Result<Vec<LiveEnvironment>, PlatformError>;

    /// Run a command inside a named environment, optionally feeding stdin.
    async fn exec(
        &self,
        environment: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, PlatformError>;
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Port {port} is already allocated")]
    PortConflict { port: u16 },

    #[error("Environment {name} not healthy after {seconds}s: {detail}")]
    CreateTimeout {
        name: String,
        seconds: u64,
        detail: String,
    },

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Platform API error: {0}")]
    Api(String),

    #[error("Exec failed: {0}")]
    Exec(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl PlatformError {
    /// Whether re-allocating a port and retrying the create can succeed.
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, Self::PortConflict { .. })
    }
}

/// Bind-failure messages emitted by the Docker daemon and Kubernetes API.
pub fn is_port_conflict_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("port is already allocated")
        || lower.contains("address already in use")
        || lower.contains("provided port is already allocated")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_conflict_messages() {
        assert!(is_port_conflict_message(
            "driver failed programming external connectivity: Bind for 0.0.0.0:8081 failed: port is already allocated"
        ));
        assert!(is_port_conflict_message("listen tcp 0.0.0.0:8081: bind: Address already in use"));
        assert!(is_port_conflict_message(
            "Service \"x\" is invalid: spec.ports[0].nodePort: Invalid value: 30081: provided port is already allocated"
        ));
        assert!(!is_port_conflict_message("no such image"));
    }
}
