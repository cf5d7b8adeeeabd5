// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Fleet Configuration Types
//
// Defines the configuration schema for a rulefleet orchestrator node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Platform backend selection (local Docker or Kubernetes cluster)
// - Port range, runtime credentials and the default shared environment
// - Deployment timeouts and reconciliation cadence
// - Database, network and observability settings

use crate::domain::container::Platform;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "rulefleet.io/v1";
pub const KIND: &str = "FleetConfig";

/// Kubernetes default `--service-node-port-range`
const NODE_PORT_MIN: u16 = 30000;
const NODE_PORT_MAX: u16 = 32767;

/// Top-level Kubernetes-style fleet configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfigManifest {
    /// API version (must be "rulefleet.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "FleetConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: FleetConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Body of the manifest (content under `spec:`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfigSpec {
    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub ports: PortRangeConfig,

    /// Credentials and paths of the rule runtime (KIE server)
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub default_environment: DefaultEnvironment,

    #[serde(default)]
    pub deployment: DeploymentConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Registry database. Absent means the in-memory registry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Which driver hosts dedicated environments
    #[serde(default = "default_platform_kind")]
    pub kind: Platform,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kind: default_platform_kind(),
            docker: DockerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Path to Docker socket. Default: platform default via bollard
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    /// Docker network every environment is attached to (created if missing)
    #[serde(default = "default_docker_network")]
    pub network: String,

    #[serde(default = "default_runtime_image")]
    pub image: String,

    /// Port the runtime listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Host used to build endpoints from published ports (e.g. "localhost").
    /// When unset, endpoints use the container name on the Docker network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Pull the image when it is not present locally
    #[serde(default = "default_true")]
    pub autopull: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            network: default_docker_network(),
            image: default_runtime_image(),
            container_port: default_container_port(),
            advertise_host: None,
            autopull: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Kubernetes API server
    #[serde(default = "default_cluster_api_url")]
    pub api_url: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Service account bearer token
    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// Cluster CA bundle (PEM). Unset means the system roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<String>,

    #[serde(default = "default_runtime_image")]
    pub image: String,

    #[serde(default = "default_container_port")]
    pub container_port: u16,

    #[serde(default = "default_kubectl_path")]
    pub kubectl_path: String,

    /// Node address used to build NodePort endpoints.
    /// When unset, endpoints use the in-cluster service DNS name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: default_cluster_api_url(),
            namespace: default_namespace(),
            token_path: default_token_path(),
            ca_path: None,
            image: default_runtime_image(),
            container_port: default_container_port(),
            kubectl_path: default_kubectl_path(),
            advertise_host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRangeConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Re-allocations attempted after a port conflict during create
    #[serde(default = "default_max_allocation_retries")]
    pub max_allocation_retries: u32,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            max_port: default_max_port(),
            max_allocation_retries: default_max_allocation_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_username")]
    pub username: String,

    #[serde(default = "default_runtime_password")]
    pub password: String,

    /// Readiness path probed on every environment
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Maven repository root inside runtime environments
    #[serde(default = "default_maven_repository")]
    pub maven_repository: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            username: default_runtime_username(),
            password: default_runtime_password(),
            health_path: default_health_path(),
            maven_repository: default_maven_repository(),
        }
    }
}

/// The always-present shared environment every artifact is also deployed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultEnvironment {
    /// Environment name on the platform (used for exec transfers)
    #[serde(default = "default_environment_name")]
    pub name: String,

    #[serde(default = "default_environment_endpoint")]
    pub endpoint: String,
}

impl Default for DefaultEnvironment {
    fn default() -> Self {
        Self {
            name: default_environment_name(),
            endpoint: default_environment_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Upper bound for an environment to become healthy after create
    #[serde(default = "default_create_timeout", with = "humantime_serde")]
    pub create_timeout: Duration,

    /// Upper bound for a loaded unit to reach STARTED
    #[serde(default = "default_activation_timeout", with = "humantime_serde")]
    pub activation_timeout: Duration,

    /// Attempts per copy/activate step
    #[serde(default = "default_step_attempts")]
    pub step_attempts: u32,

    /// Attempts per health probe
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    #[serde(default = "default_probe_base_delay", with = "humantime_serde")]
    pub probe_base_delay: Duration,

    #[serde(default = "default_probe_max_delay", with = "humantime_serde")]
    pub probe_max_delay: Duration,

    /// Timeout of a single HTTP request to a runtime
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            create_timeout: default_create_timeout(),
            activation_timeout: default_activation_timeout(),
            step_attempts: default_step_attempts(),
            probe_attempts: default_probe_attempts(),
            probe_base_delay: default_probe_base_delay(),
            probe_max_delay: default_probe_max_delay(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus scrape port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_platform_kind() -> Platform {
    Platform::Local
}

fn default_docker_network() -> String {
    "rulefleet".to_string()
}

fn default_runtime_image() -> String {
    "quay.io/kiegroup/kie-server-showcase:latest".to_string()
}

fn default_container_port() -> u16 {
    8080
}

fn default_cluster_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "rulefleet".to_string()
}

fn default_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_kubectl_path() -> String {
    "kubectl".to_string()
}

fn default_base_port() -> u16 {
    8081
}

fn default_max_port() -> u16 {
    8999
}

fn default_max_allocation_retries() -> u32 {
    5
}

fn default_runtime_username() -> String {
    "kieserver".to_string()
}

fn default_runtime_password() -> String {
    "kieserver1!".to_string()
}

fn default_health_path() -> String {
    "/kie-server/services/rest/server".to_string()
}

fn default_maven_repository() -> String {
    "/opt/jboss/.m2/repository".to_string()
}

fn default_environment_name() -> String {
    "drools".to_string()
}

fn default_environment_endpoint() -> String {
    "http://drools:8080".to_string()
}

fn default_create_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_activation_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_step_attempts() -> u32 {
    3
}

fn default_probe_attempts() -> u32 {
    3
}

fn default_probe_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_probe_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_max_connections() -> u32 {
    10
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for FleetConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "rulefleet-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: FleetConfigSpec::default(),
        }
    }
}

impl FleetConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. RULEFLEET_CONFIG_PATH environment variable
    /// 2. ./rulefleet-config.yaml (working directory)
    /// 3. ~/.rulefleet/config.yaml (user home)
    /// 4. /etc/rulefleet/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("RULEFLEET_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./rulefleet-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".rulefleet").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/rulefleet/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RULEFLEET_DATABASE_URL") {
            if !url.is_empty() {
                tracing::info!("Environment override: RULEFLEET_DATABASE_URL");
                let max_connections = self
                    .spec
                    .database
                    .as_ref()
                    .map(|d| d.max_connections)
                    .unwrap_or_else(default_max_connections);
                self.spec.database = Some(DatabaseConfig { url, max_connections });
            }
        }

        if let Ok(val) = std::env::var("RULEFLEET_PLATFORM") {
            match val.parse::<Platform>() {
                Ok(platform) => {
                    tracing::info!("Environment override: RULEFLEET_PLATFORM={}", platform);
                    self.spec.platform.kind = platform;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for RULEFLEET_PLATFORM: '{}'. Expected local/cluster. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(password) = std::env::var("RULEFLEET_RUNTIME_PASSWORD") {
            tracing::info!("Environment override: RULEFLEET_RUNTIME_PASSWORD");
            self.spec.runtime.password = password;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let ports = &self.spec.ports;
        if ports.base_port == 0 || ports.base_port > ports.max_port {
            anyhow::bail!(
                "Invalid port range: base_port {} must be non-zero and <= max_port {}",
                ports.base_port,
                ports.max_port
            );
        }

        if self.spec.platform.kind == Platform::Cluster
            && (ports.base_port < NODE_PORT_MIN || ports.max_port > NODE_PORT_MAX)
        {
            anyhow::bail!(
                "Cluster ports {}-{} must lie inside the NodePort range {}-{}",
                ports.base_port,
                ports.max_port,
                NODE_PORT_MIN,
                NODE_PORT_MAX
            );
        }

        let endpoint = &self.spec.default_environment.endpoint;
        if reqwest::Url::parse(endpoint).is_err() {
            anyhow::bail!("spec.default_environment.endpoint is not a valid URL: '{}'", endpoint);
        }

        if self.spec.default_environment.name.is_empty() {
            anyhow::bail!("spec.default_environment.name cannot be empty");
        }

        if self.spec.deployment.step_attempts == 0 || self.spec.deployment.probe_attempts == 0 {
            anyhow::bail!("spec.deployment attempts must be at least 1");
        }

        if let Some(db) = &self.spec.database {
            if db.url.is_empty() {
                anyhow::bail!("spec.database.url cannot be empty");
            }
        }

        match self.spec.observability.logging.format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("Invalid logging format: '{}'. Expected json or text", other),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = FleetConfigManifest::default();
        assert_eq!(manifest.api_version, "rulefleet.io/v1");
        assert_eq!(manifest.kind, "FleetConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.platform.kind, Platform::Local);
        assert_eq!(manifest.spec.ports.base_port, 8081);
        assert_eq!(manifest.spec.default_environment.endpoint, "http://drools:8080");
        assert_eq!(manifest.spec.runtime.username, "kieserver");
        assert!(manifest.spec.database.is_none());
    }

    #[test]
    fn test_minimal_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: rulefleet.io/v1
kind: FleetConfig
metadata:
  name: test-node
spec:
  platform:
    kind: cluster
    cluster:
      namespace: underwriting
  ports:
    base_port: 9000
    max_port: 9100
  deployment:
    create_timeout: 90s
    probe_base_delay: 250ms
  reconciliation:
    interval: 1m
"#;
        let manifest = FleetConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.platform.kind, Platform::Cluster);
        assert_eq!(manifest.spec.platform.cluster.namespace, "underwriting");
        assert_eq!(manifest.spec.platform.cluster.container_port, 8080);
        assert_eq!(manifest.spec.ports.base_port, 9000);
        assert_eq!(manifest.spec.ports.max_allocation_retries, 5);
        assert_eq!(manifest.spec.deployment.create_timeout, Duration::from_secs(90));
        assert_eq!(manifest.spec.deployment.probe_base_delay, Duration::from_millis(250));
        assert_eq!(manifest.spec.reconciliation.interval, Duration::from_secs(60));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut manifest = FleetConfigManifest::default();
        manifest.spec.database = Some(DatabaseConfig {
            url: "postgres://localhost/rulefleet".to_string(),
            max_connections: 4,
        });
        manifest.to_yaml_file(&path).unwrap();

        let loaded = FleetConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, manifest.metadata.name);
        assert_eq!(loaded.spec.deployment.create_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = FleetConfigManifest::load_or_default(Some(dir.path().join("missing.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        let mut manifest = FleetConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.metadata.name = "".to_string();
        assert!(manifest.validate().is_err());
        manifest.metadata.name = "test-node".to_string();

        manifest.spec.ports.base_port = 9000;
        manifest.spec.ports.max_port = 8000;
        assert!(manifest.validate().is_err());
        manifest.spec.ports = PortRangeConfig::default();

        manifest.spec.platform.kind = Platform::Cluster;
        assert!(manifest.validate().is_err());
        manifest.spec.ports.base_port = 30100;
        manifest.spec.ports.max_port = 30199;
        assert!(manifest.validate().is_ok());
        manifest.spec.platform.kind = Platform::Local;
        manifest.spec.ports = PortRangeConfig::default();

        manifest.spec.default_environment.endpoint = "not a url".to_string();
        assert!(manifest.validate().is_err());
        manifest.spec.default_environment = DefaultEnvironment::default();

        manifest.spec.observability.logging.format = "xml".to_string();
        assert!(manifest.validate().is_err());
    }
}
