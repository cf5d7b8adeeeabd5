// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon HTTP server implementation

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rulefleet_core::{
    application::{spawn_reconciliation_loop, ContainerOrchestrator, RequestRouter, StandardContainerOrchestrator},
    domain::{
        node_config::FleetConfigManifest,
        repository::{PostgresConfig, StorageBackend},
    },
    infrastructure::{
        event_bus::EventBus,
        platform::{build_runtime_client, create_platform_driver},
        repositories::create_container_registry,
        KieServerClient,
    },
    presentation::api::{app, AppState},
};

use super::{remove_pid_file, write_pid_file};

/// Where the daemon binds, after CLI flags override the config
pub struct BindOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub async fn start_daemon(config_path: Option<PathBuf>, bind: BindOptions) -> Result<()> {
    let pid = std::process::id();
    write_pid_file(pid)?;

    // Ensure PID file cleanup on exit
    let _guard = PidFileGuard;

    info!("rulefleet daemon starting (PID: {})", pid);

    let config = FleetConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    let spec = &config.spec;

    info!(
        node = %config.metadata.name,
        platform = %spec.platform.kind,
        default_endpoint = %spec.default_environment.endpoint,
        "Configuration loaded"
    );

    if spec.observability.metrics.enabled {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], spec.observability.metrics.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics exposed on {}", addr);
    }

    let backend = match &spec.database {
        Some(db) => StorageBackend::PostgreSQL(PostgresConfig {
            connection_string: db.url.clone(),
            max_connections: db.max_connections,
        }),
        None => {
            warn!("No database configured; registry state is lost on restart");
            StorageBackend::InMemory
        }
    };
    let registry = create_container_registry(&backend)
        .await
        .context("Failed to initialize container registry")?;

    let http = build_runtime_client(spec)?;
    let driver = create_platform_driver(spec, http.clone())?;
    let runtime = Arc::new(KieServerClient::new(http, &spec.runtime));
    let event_bus = Arc::new(EventBus::with_default_capacity());

    let orchestrator: Arc<dyn ContainerOrchestrator> = Arc::new(StandardContainerOrchestrator::new(
        registry.clone(),
        driver.clone(),
        runtime.clone(),
        event_bus.clone(),
        spec,
    ));
    let router = Arc::new(RequestRouter::new(
        registry,
        driver,
        runtime,
        event_bus.clone(),
        spec.default_environment.endpoint.clone(),
    ));

    let shutdown = CancellationToken::new();
    let reconciler = spec.reconciliation.enabled.then(|| {
        spawn_reconciliation_loop(orchestrator.clone(), spec.reconciliation.interval, shutdown.clone())
    });

    let app = app(AppState {
        orchestrator,
        router,
        event_bus,
        start_time: Instant::now(),
    });

    let host = bind.host.unwrap_or_else(|| spec.network.bind_address.clone());
    let port = bind.port.unwrap_or(spec.network.port);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Daemon listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Some(handle) = reconciler {
        let _ = handle.await;
    }

    info!("Daemon shutting down");

    Ok(())
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
