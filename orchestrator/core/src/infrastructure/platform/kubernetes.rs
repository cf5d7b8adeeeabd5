// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster driver.
//!
//! Talks to the Kubernetes REST API directly: each rule-set gets a
//! one-replica Deployment and a NodePort Service whose `nodePort` is the
//! allocated port. Commands inside environments run through
//! `kubectl exec -i`.

use crate::domain::container::{ContainerId, HealthStatus, Platform};
use crate::domain::node_config::ClusterConfig;
use crate::domain::platform::{
    is_port_conflict_message, EnvironmentHandle, EnvironmentSpec, ExecOutput, LiveEnvironment,
    PlatformDriver, PlatformError,
};
use crate::infrastructure::platform::probe::{Backoff, HealthProbe};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_CONTAINER_ID: &str = "rulefleet.io/container-id";
pub const LABEL_PORT: &str = "rulefleet.io/port";
const MANAGER: &str = "rulefleet";

pub struct KubernetesDriver {
    client: reqwest::Client,
    config: ClusterConfig,
    probe: HealthProbe,
    create_timeout: Duration,
    /// (name, value) pairs passed to every runtime container
    env: Vec<(String, String)>,
}

impl KubernetesDriver {
    pub fn new(
        config: ClusterConfig,
        probe: HealthProbe,
        create_timeout: Duration,
        request_timeout: Duration,
        env: Vec<(String, String)>,
    ) -> Result<Self, PlatformError> {
        let token = std::fs::read_to_string(&config.token_path).map_err(|e| {
            PlatformError::Connection(format!(
                "Failed to read service account token at {}: {}",
                config.token_path, e
            ))
        })?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|e| PlatformError::Connection(format!("Invalid service account token: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout);

        if let Some(ca_path) = &config.ca_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                PlatformError::Connection(format!("Failed to read cluster CA at {}: {}", ca_path, e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| PlatformError::Connection(format!("Invalid cluster CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| PlatformError::Connection(format!("Failed to build API client: {}", e)))?;

        Ok(Self {
            client,
            config,
            probe,
            create_timeout,
            env,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    fn deployments_url(&self) -> String {
        self.api(&format!("/apis/apps/v1/namespaces/{}/deployments", self.config.namespace))
    }

    fn services_url(&self) -> String {
        self.api(&format!("/api/v1/namespaces/{}/services", self.config.namespace))
    }

    fn endpoint_for(&self, name: &str, port: u16) -> String {
        match &self.config.advertise_host {
            Some(host) => format!("http://{}:{}", host, port),
            None => format!(
                "http://{}.{}.svc.cluster.local:{}",
                name, self.config.namespace, self.config.container_port
            ),
        }
    }

    fn labels(name: &str, spec: &EnvironmentSpec) -> Value {
        json!({
            LABEL_MANAGED_BY: MANAGER,
            LABEL_NAME: name,
            LABEL_CONTAINER_ID: spec.container_id.as_str(),
            LABEL_PORT: spec.port.to_string(),
        })
    }

    fn service_manifest(&self, name: &str, spec: &EnvironmentSpec) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": name, "labels": Self::labels(name, spec) },
            "spec": {
                "type": "NodePort",
                "selector": { LABEL_NAME: name },
                "ports": [{
                    "name": "http",
                    "port": self.config.container_port,
                    "targetPort": self.config.container_port,
                    "nodePort": spec.port,
                }]
            }
        })
    }

    fn deployment_manifest(&self, name: &str, spec: &EnvironmentSpec) -> Value {
        let mut env: Vec<Value> = self
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        env.push(json!({ "name": "KIE_SERVER_ID", "value": spec.container_id.as_str() }));

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name, "labels": Self::labels(name, spec) },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": { LABEL_NAME: name } },
                "template": {
                    "metadata": { "labels": Self::labels(name, spec) },
                    "spec": {
                        "containers": [{
                            "name": "kie-server",
                            "image": self.config.image,
                            "ports": [{ "containerPort": self.config.container_port }],
                            "env": env,
                        }]
                    }
                }
            }
        })
    }

    async fn api_error(resp: reqwest::Response) -> (StatusCode, String) {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        (status, message)
    }

    /// POST a manifest. Returns false when the object already existed.
    async fn create_object(&self, url: &str, manifest: &Value, port: u16) -> Result<bool, PlatformError> {
        let resp = self
            .client
            .post(url)
            .json(manifest)
            .send()
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(true);
        }
        let (status, message) = Self::api_error(resp).await;
        match status {
            StatusCode::CONFLICT => Ok(false),
            StatusCode::UNPROCESSABLE_ENTITY if is_port_conflict_message(&message) => {
                Err(PlatformError::PortConflict { port })
            }
            _ => Err(PlatformError::Api(format!("{} {}: {}", status, url, message))),
        }
    }

    async fn get_object(&self, url: &str) -> Result<Option<Value>, PlatformError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let (status, message) = Self::api_error(resp).await;
            return Err(PlatformError::Api(format!("{} {}: {}", status, url, message)));
        }
        resp.json::<Value>()
            .await
            .map(Some)
            .map_err(|e| PlatformError::Api(format!("Invalid API response: {}", e)))
    }

    async fn delete_object(&self, url: &str) -> Result<(), PlatformError> {
        let resp = self
            .client
            .delete(url)
            .json(&json!({ "kind": "DeleteOptions", "apiVersion": "v1", "propagationPolicy": "Background" }))
            .send()
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let (status, message) = Self::api_error(resp).await;
        Err(PlatformError::Api(format!("{} {}: {}", status, url, message)))
    }

    /// Scale a stopped deployment back to one replica.
    async fn ensure_scaled(&self, name: &str, deployment: &Value) -> Result<(), PlatformError> {
        let replicas = deployment["spec"]["replicas"].as_i64().unwrap_or(1);
        if replicas >= 1 {
            return Ok(());
        }
        info!(deployment = %name, "Scaling stopped environment to one replica");
        let url = format!("{}/{}", self.deployments_url(), name);
        let resp = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(json!({ "spec": { "replicas": 1 } }).to_string())
            .send()
            .await
            .map_err(|e| PlatformError::Connection(e.to_string()))?;
        if !resp.status().is_success() {
            let (status, message) = Self::api_error(resp).await;
            return Err(PlatformError::Api(format!("{} {}: {}", status, url, message)));
        }
        Ok(())
    }

    /// Poll the deployment until a replica is ready, bounded by `deadline`.
    async fn wait_ready(&self, name: &str, deadline: Instant) -> Result<(), String> {
        let url = format!("{}/{}", self.deployments_url(), name);
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));
        loop {
            match self.get_object(&url).await {
                Ok(Some(deployment)) => {
                    let ready = deployment["status"]["readyReplicas"].as_i64().unwrap_or(0);
                    if ready >= 1 {
                        return Ok(());
                    }
                    debug!(deployment = %name, ready, "Waiting for replica");
                }
                Ok(None) => return Err(format!("deployment {} disappeared", name)),
                Err(e) => debug!(deployment = %name, error = %e, "Readiness poll failed"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!("deployment {} has no ready replica", name));
            }
            tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
        }
    }

    fn node_port(service: &Value) -> Option<u16> {
        service["spec"]["ports"]
            .as_array()?
            .iter()
            .find_map(|p| p["nodePort"].as_u64())
            .and_then(|p| u16::try_from(p).ok())
    }
}

#[async_trait]
impl PlatformDriver for KubernetesDriver {
    fn platform(&self) -> Platform {
        Platform::Cluster
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, PlatformError> {
        let name = spec.container_id.environment_name();
        let deadline = Instant::now() + self.create_timeout;

        // Service first: a taken nodePort is rejected before any pod exists
        let service_created = self
            .create_object(&self.services_url(), &self.service_manifest(&name, spec), spec.port)
            .await?;
        let port = if service_created {
            spec.port
        } else {
            debug!(service = %name, "Service already present");
            let existing = self.get_object(&format!("{}/{}", self.services_url(), name)).await?;
            existing.as_ref().and_then(Self::node_port).unwrap_or(spec.port)
        };

        match self
            .create_object(&self.deployments_url(), &self.deployment_manifest(&name, spec), port)
            .await
        {
            Ok(true) => info!(deployment = %name, port, "Created environment"),
            Ok(false) => {
                debug!(deployment = %name, "Deployment already present");
                if let Some(existing) = self.get_object(&format!("{}/{}", self.deployments_url(), name)).await? {
                    self.ensure_scaled(&name, &existing).await?;
                }
            }
            Err(e) => {
                if service_created {
                    let _ = self.delete_object(&format!("{}/{}", self.services_url(), name)).await;
                }
                return Err(e);
            }
        }

        let timeout_error = |detail: String| PlatformError::CreateTimeout {
            name: name.clone(),
            seconds: self.create_timeout.as_secs(),
            detail,
        };

        self.wait_ready(&name, deadline).await.map_err(timeout_error)?;

        let endpoint = self.endpoint_for(&name, port);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(outcome) = self.probe.wait_until_healthy(&endpoint, remaining).await {
            return Err(timeout_error(format!("last probe of {} was {:?}", endpoint, outcome)));
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
        self.delete_object(&format!("{}/{}", self.deployments_url(), name)).await?;
        self.delete_object(&format!("{}/{}", self.services_url(), name)).await?;
        info!(deployment = %name, "Removed environment");
        Ok(())
    }

    async fn health_check(&self, endpoint: &str) -> HealthStatus {
        self.probe.health(endpoint).await
    }

    async fn list(&self) -> Result<Vec<LiveEnvironment>, PlatformError> {
        let selector = format!("{}={}", LABEL_MANAGED_BY, MANAGER);
        let fetch = |url: String| {
            let selector = selector.clone();
            async move {
                let resp = self
                    .client
                    .get(&url)
                    .query(&[("labelSelector", selector.as_str())])
                    .send()
                    .await
                    .map_err(|e| PlatformError::Connection(e.to_string()))?;
                if !resp.status().is_success() {
                    let (status, message) = Self::api_error(resp).await;
                    return Err(PlatformError::Api(format!("{} {}: {}", status, url, message)));
                }
                resp.json::<Value>()
                    .await
                    .map_err(|e| PlatformError::Api(format!("Invalid API response: {}", e)))
            }
        };

        let deployments = fetch(self.deployments_url()).await?;
        let services = fetch(self.services_url()).await?;

        let node_ports: HashMap<String, u16> = services["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|svc| {
                        let name = svc["metadata"]["name"].as_str()?.to_string();
                        Some((name, Self::node_port(svc)?))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let live = deployments["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|dep| {
                        let metadata = &dep["metadata"];
                        let name = metadata["name"].as_str()?.to_string();
                        let labels = &metadata["labels"];
                        let port = node_ports.get(&name).copied().or_else(|| {
                            labels[LABEL_PORT].as_str().and_then(|p| p.parse().ok())
                        });
                        Some(LiveEnvironment {
                            container_id: labels[LABEL_CONTAINER_ID]
                                .as_str()
                                .and_then(|id| ContainerId::parse(id).ok()),
                            name,
                            port,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(live)
    }

    async fn exec(
        &self,
        environment: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, PlatformError> {
        let mut cmd = tokio::process::Command::new(&self.config.kubectl_path);
        cmd.arg("exec")
            .arg("-i")
            .arg("-n")
            .arg(&self.config.namespace)
            .arg(format!("deploy/{}", environment))
            .arg("--")
            .args(command)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| PlatformError::Exec(format!("Failed to spawn {}: {}", self.config.kubectl_path, e)))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            if let Err(e) = pipe.write_all(&data).await {
                warn!(environment, error = %e, "Failed to stream stdin to kubectl");
            }
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PlatformError::Exec(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: Bytes::from(output.stdout),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node_config::{DeploymentConfig, RuntimeConfig};
    use crate::domain::container::{RulesetId, TenantId};

    fn driver(api_url: String) -> (KubernetesDriver, tempfile::NamedTempFile) {
        let token = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(token.path(), "test-token\n").unwrap();
        let config = ClusterConfig {
            api_url,
            namespace: "rules".to_string(),
            token_path: token.path().to_string_lossy().to_string(),
            ..Default::default()
        };
        let deployment = DeploymentConfig {
            probe_attempts: 1,
            probe_base_delay: Duration::from_millis(5),
            probe_max_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let probe = HealthProbe::new(reqwest::Client::new(), &RuntimeConfig::default(), &deployment);
        let driver = KubernetesDriver::new(
            config,
            probe,
            Duration::from_millis(200),
            Duration::from_secs(5),
            vec![],
        )
        .unwrap();
        (driver, token)
    }

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            container_id: ContainerId::for_ruleset(&TenantId::new("chase"), &RulesetId::new("loan")),
            port: 30081,
        }
    }

    #[tokio::test]
    async fn test_service_port_conflict() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/namespaces/rules/services")
            .match_header("authorization", "Bearer test-token")
            .with_status(422)
            .with_body(r#"{"kind":"Status","message":"Service \"x\" is invalid: spec.ports[0].nodePort: Invalid value: 30081: provided port is already allocated"}"#)
            .create_async()
            .await;

        let (driver, _token) = driver(server.url());
        let err = driver.create(&spec()).await.unwrap_err();
        assert!(matches!(err, PlatformError::PortConflict { port: 30081 }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let mut server = mockito::Server::new_async().await;
        let name = spec().container_id.environment_name();
        let dep = server
            .mock("DELETE", format!("/apis/apps/v1/namespaces/rules/deployments/{}", name).as_str())
            .with_status(404)
            .create_async()
            .await;
        let svc = server
            .mock("DELETE", format!("/api/v1/namespaces/rules/services/{}", name).as_str())
            .with_status(404)
            .create_async()
            .await;

        let (driver, _token) = driver(server.url());
        driver.delete(&spec().container_id).await.unwrap();
        dep.assert_async().await;
        svc.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_joins_node_ports() {
        let mut server = mockito::Server::new_async().await;
        let _deployments = server
            .mock("GET", "/apis/apps/v1/namespaces/rules/deployments")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "items": [{
                        "metadata": {
                            "name": "rulefleet-chase-loan-underwriting-rules",
                            "labels": {
                                "rulefleet.io/container-id": "chase-loan-underwriting-rules",
                                "rulefleet.io/port": "30081"
                            }
                        }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;
        let _services = server
            .mock("GET", "/api/v1/namespaces/rules/services")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "items": [{
                        "metadata": { "name": "rulefleet-chase-loan-underwriting-rules" },
                        "spec": { "ports": [{ "nodePort": 30090 }] }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let (driver, _token) = driver(server.url());
        let live = driver.list().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].port, Some(30090));
        assert_eq!(
            live[0].container_id.as_ref().map(ContainerId::as_str),
            Some("chase-loan-underwriting-rules")
        );
    }
}
