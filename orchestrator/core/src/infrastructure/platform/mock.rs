// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process platform driver for tests and local development.
//!
//! Environments are entries in a map; `tar xf -` and `tar cf -` execs are
//! interpreted against a per-environment file table so artifact transfers
//! can be asserted on. Failures are injected through the `fail_*` and
//! `occupy_*` helpers.

use crate::domain::container::{ContainerId, HealthStatus, Platform};
use crate::domain::platform::{
    EnvironmentHandle, EnvironmentSpec, ExecOutput, LiveEnvironment, PlatformDriver, PlatformError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::Read;
use std::time::Duration;

/// Create failures the mock can be told to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    PortConflict,
    CreateTimeout,
    Api,
}

#[derive(Debug, Clone)]
struct MockEnvironment {
    container_id: Option<ContainerId>,
    port: Option<u16>,
    endpoint: String,
    /// Listed by `list()`; unmanaged environments only receive execs
    managed: bool,
}

#[derive(Default)]
struct MockState {
    environments: HashMap<String, MockEnvironment>,
    files: HashMap<String, BTreeMap<String, Bytes>>,
    occupied_ports: HashSet<u16>,
    create_failures: VecDeque<MockFailure>,
    exec_failures: HashSet<String>,
    unhealthy_endpoints: HashSet<String>,
    list_fails: bool,
    delete_fails: bool,
    create_calls: Vec<EnvironmentSpec>,
    delete_calls: Vec<ContainerId>,
    create_delay: Option<Duration>,
}

pub struct MockPlatformDriver {
    platform: Platform,
    state: Mutex<MockState>,
}

impl MockPlatformDriver {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Register an environment this system does not manage (the default
    /// shared environment). It accepts execs but is never listed.
    pub fn with_static_environment(self, name: &str, endpoint: &str) -> Self {
        self.state.lock().environments.insert(
            name.to_string(),
            MockEnvironment {
                container_id: None,
                port: None,
                endpoint: endpoint.to_string(),
                managed: false,
            },
        );
        self
    }

    pub fn endpoint_for(port: u16) -> String {
        format!("http://localhost:{}", port)
    }

    /// A managed environment that exists on the platform without going
    /// through `create` (an orphan from the registry's point of view).
    pub fn add_live_environment(&self, name: &str, container_id: Option<ContainerId>, port: u16) {
        self.state.lock().environments.insert(
            name.to_string(),
            MockEnvironment {
                container_id,
                port: Some(port),
                endpoint: Self::endpoint_for(port),
                managed: true,
            },
        );
    }

    /// Simulate an operator removing the environment behind our back.
    pub fn remove_externally(&self, container_id: &ContainerId) -> bool {
        self.state
            .lock()
            .environments
            .remove(&container_id.environment_name())
            .is_some()
    }

    /// A port held by something outside the platform's listing.
    pub fn occupy_port(&self, port: u16) {
        self.state.lock().occupied_ports.insert(port);
    }

    pub fn fail_next_create(&self, failure: MockFailure) {
        self.state.lock().create_failures.push_back(failure);
    }

    pub fn fail_exec_for(&self, environment: &str) {
        self.state.lock().exec_failures.insert(environment.to_string());
    }

    pub fn clear_exec_failures(&self) {
        self.state.lock().exec_failures.clear();
    }

    pub fn set_unhealthy(&self, endpoint: &str, unhealthy: bool) {
        let mut state = self.state.lock();
        if unhealthy {
            state.unhealthy_endpoints.insert(endpoint.to_string());
        } else {
            state.unhealthy_endpoints.remove(endpoint);
        }
    }

    pub fn set_list_failure(&self, fails: bool) {
        self.state.lock().list_fails = fails;
    }

    pub fn set_delete_failure(&self, fails: bool) {
        self.state.lock().delete_fails = fails;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = Some(delay);
    }

    /// Every spec passed to `create`, in call order
    pub fn create_calls(&self) -> Vec<EnvironmentSpec> {
        self.state.lock().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<ContainerId> {
        self.state.lock().delete_calls.clone()
    }

    pub fn environment_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().environments.keys().cloned().collect();
        names.sort();
        names
    }

    /// Files present in an environment, as absolute paths
    pub fn files(&self, environment: &str) -> Vec<String> {
        self.state
            .lock()
            .files
            .get(environment)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn put_file(&self, environment: &str, path: &str, content: impl Into<Bytes>) {
        self.state
            .lock()
            .files
            .entry(environment.to_string())
            .or_default()
            .insert(path.to_string(), content.into());
    }

    fn failure_output(message: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 2,
            stdout: Bytes::new(),
            stderr: message.to_string(),
        }
    }

    /// `tar xf - -C <dir>`
    fn extract(&self, environment: &str, dir: &str, archive: &[u8]) -> ExecOutput {
        let mut extracted = Vec::new();
        let mut reader = tar::Archive::new(archive);
        let entries = match reader.entries() {
            Ok(entries) => entries,
            Err(e) => return Self::failure_output(&format!("tar: {}", e)),
        };
        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Self::failure_output(&format!("tar: {}", e)),
            };
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = match entry.path() {
                Ok(path) => path.to_string_lossy().to_string(),
                Err(e) => return Self::failure_output(&format!("tar: {}", e)),
            };
            let mut content = Vec::new();
            if let Err(e) = entry.read_to_end(&mut content) {
                return Self::failure_output(&format!("tar: {}", e));
            }
            extracted.push((format!("{}/{}", dir.trim_end_matches('/'), path), Bytes::from(content)));
        }

        let mut state = self.state.lock();
        let files = state.files.entry(environment.to_string()).or_default();
        for (path, content) in extracted {
            files.insert(path, content);
        }
        ExecOutput::default()
    }

    /// `tar cf - -C <dir> <relative>`
    fn archive(&self, environment: &str, dir: &str, relative: &str) -> ExecOutput {
        let root = format!("{}/", dir.trim_end_matches('/'));
        let prefix = format!("{}{}/", root, relative.trim_end_matches('/'));
        let selected: Vec<(String, Bytes)> = {
            let state = self.state.lock();
            state
                .files
                .get(environment)
                .map(|files| {
                    files
                        .iter()
                        .filter(|(path, _)| path.starts_with(&prefix))
                        .map(|(path, content)| (path[root.len()..].to_string(), content.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        if selected.is_empty() {
            return Self::failure_output(&format!("tar: {}: Cannot stat: No such file or directory", relative));
        }

        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in selected {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            if let Err(e) = builder.append_data(&mut header, &path, content.as_ref()) {
                return Self::failure_output(&format!("tar: {}", e));
            }
        }
        match builder.into_inner() {
            Ok(bytes) => ExecOutput {
                exit_code: 0,
                stdout: Bytes::from(bytes),
                stderr: String::new(),
            },
            Err(e) => Self::failure_output(&format!("tar: {}", e)),
        }
    }
}

#[async_trait]
impl PlatformDriver for MockPlatformDriver {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<EnvironmentHandle, PlatformError> {
        let delay = {
            let mut state = self.state.lock();
            state.create_calls.push(spec.clone());
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let name = spec.container_id.environment_name();
        let mut state = self.state.lock();

        if let Some(existing) = state.environments.get(&name) {
            let port = existing.port.unwrap_or(spec.port);
            return Ok(EnvironmentHandle {
                container_id: spec.container_id.clone(),
                name,
                endpoint: existing.endpoint.clone(),
                port,
            });
        }

        let port_taken = state.occupied_ports.contains(&spec.port)
            || state.environments.values().any(|env| env.port == Some(spec.port));
        if port_taken {
            return Err(PlatformError::PortConflict { port: spec.port });
        }

        match state.create_failures.pop_front() {
            Some(MockFailure::PortConflict) => {
                return Err(PlatformError::PortConflict { port: spec.port });
            }
            Some(MockFailure::CreateTimeout) => {
                // The half-created environment stays behind until deleted
                let endpoint = Self::endpoint_for(spec.port);
                state.environments.insert(
                    name.clone(),
                    MockEnvironment {
                        container_id: Some(spec.container_id.clone()),
                        port: Some(spec.port),
                        endpoint,
                        managed: true,
                    },
                );
                return Err(PlatformError::CreateTimeout {
                    name,
                    seconds: 0,
                    detail: "injected timeout".to_string(),
                });
            }
            Some(MockFailure::Api) => {
                return Err(PlatformError::Api("injected API failure".to_string()));
            }
            None => {}
        }

        let endpoint = Self::endpoint_for(spec.port);
        state.environments.insert(
            name.clone(),
            MockEnvironment {
                container_id: Some(spec.container_id.clone()),
                port: Some(spec.port),
                endpoint: endpoint.clone(),
                managed: true,
            },
        );

        Ok(EnvironmentHandle {
            container_id: spec.container_id.clone(),
            name,
            endpoint,
            port: spec.port,
        })
    }

    async fn delete(&self, container_id: &ContainerId) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        state.delete_calls.push(container_id.clone());
        if state.delete_fails {
            return Err(PlatformError::Api("injected delete failure".to_string()));
        }
        let name = container_id.environment_name();
        state.environments.remove(&name);
        state.files.remove(&name);
        Ok(())
    }

    async fn health_check(&self, endpoint: &str) -> HealthStatus {
        let state = self.state.lock();
        if state.unhealthy_endpoints.contains(endpoint) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        }
    }

    async fn list(&self) -> Result<Vec<LiveEnvironment>, PlatformError> {
        let state = self.state.lock();
        if state.list_fails {
            return Err(PlatformError::Connection("injected list failure".to_string()));
        }
        let mut live: Vec<_> = state
            .environments
            .iter()
            .filter(|(_, env)| env.managed)
            .map(|(name, env)| LiveEnvironment {
                name: name.clone(),
                container_id: env.container_id.clone(),
                port: env.port,
            })
            .collect();
        live.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(live)
    }

    async fn exec(
        &self,
        environment: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<ExecOutput, PlatformError> {
        {
            let state = self.state.lock();
            if !state.environments.contains_key(environment) {
                return Err(PlatformError::NotFound(environment.to_string()));
            }
            if state.exec_failures.contains(environment) {
                return Ok(Self::failure_output("injected exec failure"));
            }
        }

        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["tar", "xf", "-", "-C", dir] => {
                let archive = stdin.unwrap_or_default();
                Ok(self.extract(environment, dir, &archive))
            }
            ["tar", "cf", "-", "-C", dir, relative] => Ok(self.archive(environment, dir, relative)),
            _ => Ok(ExecOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::container::{RulesetId, TenantId};

    fn spec(tenant: &str, port: u16) -> EnvironmentSpec {
        EnvironmentSpec {
            container_id: ContainerId::for_ruleset(&TenantId::new(tenant), &RulesetId::new("loan")),
            port,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let driver = MockPlatformDriver::new(Platform::Local);
        let first = driver.create(&spec("chase", 8081)).await.unwrap();
        let second = driver.create(&spec("chase", 8090)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_port_conflict_across_ids() {
        let driver = MockPlatformDriver::new(Platform::Local);
        driver.create(&spec("chase", 8081)).await.unwrap();
        let err = driver.create(&spec("wells", 8081)).await.unwrap_err();
        assert!(err.is_port_conflict());
    }

    #[tokio::test]
    async fn test_tar_roundtrip_between_environments() {
        let driver = MockPlatformDriver::new(Platform::Local)
            .with_static_environment("drools", "http://drools:8080");
        driver.put_file("drools", "/repo/com/acme/rules/1.0/rules-1.0.jar", b"jar".to_vec());

        let cf = ["tar", "cf", "-", "-C", "/repo", "com/acme/rules/1.0"].map(String::from);
        let archive = driver.exec("drools", &cf, None).await.unwrap();
        assert!(archive.success());

        let handle = driver.create(&spec("chase", 8081)).await.unwrap();
        let xf = ["tar", "xf", "-", "-C", "/repo"].map(String::from);
        let out = driver.exec(&handle.name, &xf, Some(archive.stdout)).await.unwrap();
        assert!(out.success());
        assert_eq!(driver.files(&handle.name), vec!["/repo/com/acme/rules/1.0/rules-1.0.jar".to_string()]);
    }

    #[tokio::test]
    async fn test_exec_on_missing_environment() {
        let driver = MockPlatformDriver::new(Platform::Local);
        let err = driver.exec("nope", &["true".to_string()], None).await.unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
    }
}
