// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::container::{ContainerId, HealthStatus, Platform};
use crate::domain::node_config::DockerConfig;
use crate::domain::platform::{
    is_port_conflict_message, EnvironmentHandle, EnvironmentSpec, ExecOutput, LiveEnvironment,
    PlatformDriver, PlatformError,
};
use crate::infrastructure::platform::probe::HealthProbe;
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, NetworkCreateRequest, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
    InspectNetworkOptions, ListContainersOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions,
};
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const LABEL_MANAGED: &str = "rulefleet.managed";
pub const LABEL_CONTAINER_ID: &str = "rulefleet.container-id";
pub const LABEL_PORT: &str = "rulefleet.port";

/// Local-container driver: one Docker container per rule-set
pub struct DockerDriver {
    docker: Docker,
    config: DockerConfig,
    probe: HealthProbe,
    create_timeout: Duration,
    /// Extra `KEY=VALUE` variables passed to every runtime container
    env: Vec<String>,
}

impl DockerDriver {
    pub fn new(
        config: DockerConfig,
        probe: HealthProbe,
        create_timeout: Duration,
        env: Vec<String>,
    ) -> Result<Self, PlatformError> {
        // Connect to Docker daemon (custom socket or auto-detect)
        let docker = if let Some(path) = &config.socket_path {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                PlatformError::Connection(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                PlatformError::Connection(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self {
            docker,
            config,
            probe,
            create_timeout,
            env,
        })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), PlatformError> {
        self.docker.ping().await.map_err(|e| {
            PlatformError::Connection(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    fn endpoint_for(&self, name: &str, port: u16) -> String {
        match &self.config.advertise_host {
            Some(host) => format!("http://{}:{}", host, port),
            None => format!("http://{}:{}", name, self.config.container_port),
        }
    }

    async fn ensure_network(&self) -> Result<(), PlatformError> {
        match self
            .docker
            .inspect_network(&self.config.network, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                info!(network = %self.config.network, "Creating Docker network");
                let request = NetworkCreateRequest {
                    name: self.config.network.clone(),
                    driver: Some("bridge".to_string()),
                    ..Default::default()
                };
                match self.docker.create_network(request).await {
                    Ok(_) => Ok(()),
                    // Lost a creation race with another deploy
                    Err(e) if is_conflict(&e) => Ok(()),
                    Err(e) => Err(PlatformError::Api(format!("Failed to create network: {}", e))),
                }
            }
            Err(e) => Err(PlatformError::Api(format!("Failed to inspect network: {}", e))),
        }
    }

    async fn ensure_image(&self) -> Result<(), PlatformError> {
        let image = &self.config.image;
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.config.autopull {
            return Err(PlatformError::Api(format!(
                "Image {} not found locally and autopull is disabled",
                image
            )));
        }

        info!("Pulling image: {}", image);
        let options = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(PlatformError::Api(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    image, e, image
                )));
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Start an existing container if needed and return its port.
    async fn adopt_existing(&self, name: &str, labels: &HashMap<String, String>, running: bool, requested: u16) -> Result<u16, PlatformError> {
        let port = labels
            .get(LABEL_PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or(requested);

        if !running {
            info!(container = %name, "Starting stopped environment");
            if let Err(e) = self.docker.start_container(name, None::<StartContainerOptions>).await {
                return Err(self.classify_start_error(name, port, e).await);
            }
        } else {
            debug!(container = %name, "Environment already present");
        }
        Ok(port)
    }

    async fn provision(&self, spec: &EnvironmentSpec, name: &str) -> Result<(), PlatformError> {
        self.ensure_image().await?;

        let container_port = format!("{}/tcp", self.config.container_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(self.config.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_CONTAINER_ID.to_string(), spec.container_id.to_string()),
            (LABEL_PORT.to_string(), spec.port.to_string()),
        ]);

        let mut env = self.env.clone();
        env.push(format!("KIE_SERVER_ID={}", spec.container_id));

        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            hostname: Some(name.to_string()),
            labels: Some(labels),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default().name(name).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| PlatformError::Api(format!("Failed to create container {}: {}", name, e)))?;

        if let Err(e) = self.docker.start_container(name, None::<StartContainerOptions>).await {
            return Err(self.classify_start_error(name, spec.port, e).await);
        }

        info!(container = %name, port = spec.port, "Started environment");
        Ok(())
    }

    /// Bind failures leave a created-but-dead container behind; remove it
    /// so the next attempt with another port can reuse the name.
    async fn classify_start_error(&self, name: &str, port: u16, err: DockerError) -> PlatformError {
        let message = err.to_string();
        if is_port_conflict_message(&message) {
            warn!(container = %name, port, "Port conflict while starting environment");
            self.remove(name).await.ok();
            return PlatformError::PortConflict { port };
        }
        PlatformError::Api(format!("Failed to start container {}: {}", name, message))
    }

    async fn remove(&self, name: &str) -> Result<(), PlatformError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).v(true).build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(PlatformError::Api(format!("Failed to remove container {}: {}", name, e))),
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 404, .. })
}

fn is_conflict(err: &DockerError) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code: 409, .. })
}

#[async_trait]
impl PlatformDriver for DockerDriver {
    fn platform(&self) -> Platform {
        Platform::Local
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, PlatformError> {
        let name = spec.container_id.environment_name();
        self.ensure_network().await?;

        let port = match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(existing) => {
                let labels = existing
                    .config
                    .and_then(|c| c.labels)
                    .unwrap_or_default();
                let running = existing
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                self.adopt_existing(&name, &labels, running, spec.port).await?
            }
            Err(e) if is_not_found(&e) => {
                self.provision(spec, &name).await?;
                spec.port
            }
            Err(e) => return Err(PlatformError::Api(format!("Failed to inspect {}: {}", name, e))),
        };

        let endpoint = self.endpoint_for(&name, port);
        if let Err(outcome) = self.probe.wait_until_healthy(&endpoint, self.create_timeout).await {
            return Err(PlatformError::CreateTimeout {
                name,
                seconds: self.create_timeout.as_secs(),
                detail: format!("last probe of {} was {:?}", endpoint, outcome),
            });
        }

        Ok(EnvironmentHandle {
            container_id: spec.container_id.clone(),
            name,
            endpoint,
            port,
        })
    }

    async fn delete(&self, container_id: &ContainerId) -> Result<(), PlatformError> {
        let name = container_id.environment_name();
        self.remove(&name).await?;
        info!(container = %name, "Removed environment");
        Ok(())
    }

    async fn health_check(&self, endpoint: &str) -> HealthStatus {
        self.probe.health(endpoint).await
    }

    async fn list(&self) -> Result<Vec<LiveEnvironment>, PlatformError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| PlatformError::Api(format!("Failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                let labels = summary.labels.unwrap_or_default();
                Some(LiveEnvironment {
                    name,
                    container_id: labels
                        .get(LABEL_CONTAINER_ID)
                        .and_then(|id| ContainerId::parse(id).ok()),
                    port: labels.get(LABEL_PORT).and_then(|p| p.parse().ok()),
                })
            })
            .collect())
    }

    async fn exec(
        &self,
        environment: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, PlatformError> {
        let exec_config = CreateExecOptions {
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(environment, exec_config)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    PlatformError::NotFound(environment.to_string())
                } else {
                    PlatformError::Exec(e.to_string())
                }
            })?;

        let start_opts = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let res = self
            .docker
            .start_exec(&exec.id, Some(start_opts))
            .await
            .map_err(|e| PlatformError::Exec(e.to_string()))?;

        let mut stdout = BytesMut::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, mut input } = res {
            if let Some(data) = stdin {
                input
                    .write_all(&data)
                    .await
                    .map_err(|e| PlatformError::Exec(format!("Failed to stream stdin: {}", e)))?;
                input
                    .shutdown()
                    .await
                    .map_err(|e| PlatformError::Exec(format!("Failed to close stdin: {}", e)))?;
            }
            drop(input);

            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
                    Ok(_) => {}
                    Err(e) => return Err(PlatformError::Exec(e.to_string())),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| PlatformError::Exec(format!("Failed to inspect exec: {}", e)))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: stdout.freeze(),
            stderr,
        })
    }
}
