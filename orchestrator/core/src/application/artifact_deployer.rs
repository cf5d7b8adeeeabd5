// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Artifact Deployer
//!
//! Installs a rule artifact into one environment and asks its runtime to
//! load it.
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Collaborators:** `PlatformDriver::exec` (file transfer), `RuleRuntimeClient` (activation)
//!
//! Steps per target:
//!
//! 1. **Copy**: the jar and pom are packed in Maven repository layout and
//!    unpacked with `tar xf -` under the runtime's repository. Artifacts the
//!    build pipeline already installed into the default environment are
//!    streamed out of it with `tar cf -` instead.
//! 2. **Activate**: the runtime loads the release as a unit named after the
//!    container id, then is polled until the unit reports `STARTED`.
//!
//! The deployer never touches the registry; the orchestrator decides what a
//! failed target means for the record.

use crate::domain::artifact::{Artifact, ArtifactSource, LoadOutcome, RuleRuntimeClient, UnitState};
use crate::domain::container::{ContainerId, ReleaseId};
use crate::domain::deployment::{FailureKind, StepReport, TargetReport, TargetRole};
use crate::domain::node_config::{DefaultEnvironment, DeploymentConfig, RuntimeConfig};
use crate::domain::platform::PlatformDriver;
use crate::infrastructure::platform::probe::Backoff;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One environment an artifact is installed into
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub name: String,
    pub endpoint: String,
    pub role: TargetRole,
}

impl DeployTarget {
    pub fn default_environment(env: &DefaultEnvironment) -> Self {
        Self {
            name: env.name.clone(),
            endpoint: env.endpoint.clone(),
            role: TargetRole::Default,
        }
    }

    pub fn dedicated(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            role: TargetRole::Dedicated,
        }
    }
}

pub struct ArtifactDeployer {
    driver: Arc<dyn PlatformDriver>,
    runtime: Arc<dyn RuleRuntimeClient>,
    maven_repository: String,
    default_environment: String,
    step_attempts: u32,
    activation_timeout: Duration,
    base_delay: Duration,
    max_delay: Duration,
}

impl ArtifactDeployer {
    pub fn new(
        driver: Arc<dyn PlatformDriver>,
        runtime: Arc<dyn RuleRuntimeClient>,
        runtime_config: &RuntimeConfig,
        default_environment: &DefaultEnvironment,
        deployment: &DeploymentConfig,
    ) -> Self {
        Self {
            driver,
            runtime,
            maven_repository: runtime_config.maven_repository.trim_end_matches('/').to_string(),
            default_environment: default_environment.name.clone(),
            step_attempts: deployment.step_attempts.max(1),
            activation_timeout: deployment.activation_timeout,
            base_delay: deployment.probe_base_delay,
            max_delay: deployment.probe_max_delay,
        }
    }

    pub async fn deploy(&self, target: &DeployTarget, container_id: &ContainerId, artifact: &Artifact) -> TargetReport {
        let copy = self.copy(target, artifact).await;
        let activate = if copy.is_failed() {
            StepReport::skipped("copy failed")
        } else {
            self.activate(target, container_id, &artifact.release).await
        };

        if activate.is_success() {
            info!(
                environment = %target.name,
                role = ?target.role,
                unit = %container_id,
                release = %artifact.release,
                "Artifact activated"
            );
        }

        TargetReport {
            environment: target.name.clone(),
            role: target.role,
            copy,
            activate,
        }
    }

    async fn copy(&self, target: &DeployTarget, artifact: &Artifact) -> StepReport {
        let archive = match &artifact.source {
            ArtifactSource::Inline { jar, pom } => match build_archive(&artifact.release, jar, pom) {
                Ok(archive) => archive,
                Err(e) => return StepReport::failed(FailureKind::CopyFailed, format!("failed to pack artifact: {}", e)),
            },
            ArtifactSource::DefaultEnvironment if target.role == TargetRole::Default => {
                return StepReport::skipped("artifact already present in the default environment");
            }
            ArtifactSource::DefaultEnvironment => {
                match self.with_retries("read artifact", || self.read_from_default(&artifact.release)).await {
                    Ok(archive) => archive,
                    Err(detail) => return StepReport::failed(FailureKind::CopyFailed, detail),
                }
            }
        };

        let size = archive.len();
        match self
            .with_retries("write artifact", || self.write_archive(&target.name, archive.clone()))
            .await
        {
            Ok(()) => StepReport::success_with(format!("{} bytes into {}", size, self.maven_repository)),
            Err(detail) => StepReport::failed(FailureKind::CopyFailed, detail),
        }
    }

    async fn read_from_default(&self, release: &ReleaseId) -> Result<Bytes, String> {
        let command = vec![
            "tar".to_string(),
            "cf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            self.maven_repository.clone(),
            release.repository_dir(),
        ];
        let output = self
            .driver
            .exec(&self.default_environment, &command, None)
            .await
            .map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!(
                "tar cf in {} exited {}: {}",
                self.default_environment,
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(output.stdout)
    }

    async fn write_archive(&self, environment: &str, archive: Bytes) -> Result<(), String> {
        let command = vec![
            "tar".to_string(),
            "xf".to_string(),
            "-".to_string(),
            "-C".to_string(),
            self.maven_repository.clone(),
        ];
        let output = self
            .driver
            .exec(environment, &command, Some(archive))
            .await
            .map_err(|e| e.to_string())?;
        if !output.success() {
            return Err(format!(
                "tar xf in {} exited {}: {}",
                environment,
                output.exit_code,
                output.stderr.trim()
            ));
        }
        Ok(())
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, String>>,
    {
        let mut backoff = Backoff::new(self.base_delay, self.max_delay);
        let mut last_error = String::new();
        for attempt in 1..=self.step_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, attempts = self.step_attempts, error = %e, "Failed to {}", what);
                    last_error = e;
                    if attempt < self.step_attempts {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }
        }
        Err(format!("{} failed after {} attempts: {}", what, self.step_attempts, last_error))
    }

    async fn activate(&self, target: &DeployTarget, container_id: &ContainerId, release: &ReleaseId) -> StepReport {
        let outcome = match self.runtime.load_unit(&target.endpoint, container_id, release).await {
            Ok(outcome) => outcome,
            Err(e) => return StepReport::failed(FailureKind::ActivationFailed, e.to_string()),
        };
        debug!(environment = %target.name, ?outcome, "Unit load accepted");

        let deadline = Instant::now() + self.activation_timeout;
        let mut backoff = Backoff::new(self.base_delay, self.max_delay);

        loop {
            let last_seen = match self.runtime.unit_status(&target.endpoint, container_id).await {
                Ok(info) => match info.state {
                    UnitState::Started => {
                        let detail = match &outcome {
                            LoadOutcome::Created => format!("unit started with {}", release),
                            LoadOutcome::AlreadyLoaded => format!("{} already loaded", release),
                            LoadOutcome::Upgraded { previous: Some(previous) } => {
                                format!("upgraded {} -> {}", previous, release)
                            }
                            LoadOutcome::Upgraded { previous: None } => format!("upgraded to {}", release),
                        };
                        return StepReport::success_with(detail);
                    }
                    UnitState::Failed => {
                        return StepReport::failed(
                            FailureKind::ActivationFailed,
                            format!("unit {} reported FAILED at {}", container_id, target.endpoint),
                        );
                    }
                    other => format!("{:?}", other),
                },
                Err(e) => e.to_string(),
            };

            if Instant::now() >= deadline {
                return StepReport::failed(
                    FailureKind::ActivationFailed,
                    format!(
                        "unit {} not started within {}s: {}",
                        container_id,
                        self.activation_timeout.as_secs(),
                        last_seen
                    ),
                );
            }
            debug!(environment = %target.name, state = %last_seen, "Waiting for unit to start");
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }
}

/// Pack jar and pom in Maven repository layout.
pub fn build_archive(release: &ReleaseId, jar: &[u8], pom: &[u8]) -> std::io::Result<Bytes> {
    let dir = release.repository_dir();
    let stem = release.file_stem();
    let mut builder = tar::Builder::new(Vec::new());

    for (extension, content) in [("jar", jar), ("pom", pom)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, format!("{}/{}.{}", dir, stem, extension), content)?;
    }

    Ok(Bytes::from(builder.into_inner()?))
}
