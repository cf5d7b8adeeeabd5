// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP API
//!
//! | Method | Path | Service call |
//! |--------|------|--------------|
//! | GET | `/health` | liveness |
//! | POST | `/api/deployments` | `ContainerOrchestrator::deploy` |
//! | GET | `/api/containers?all=` | `ContainerOrchestrator::list` |
//! | GET | `/api/containers/{id}` | `ContainerOrchestrator::get` |
//! | DELETE | `/api/containers/{id}` | `ContainerOrchestrator::teardown` |
//! | GET | `/api/containers/{id}/history` | `ContainerOrchestrator::history` |
//! | GET | `/api/containers/{id}/resolve` | `RequestRouter::resolve` |
//! | POST | `/api/containers/{id}/evaluate` | `RequestRouter::evaluate` |
//! | POST | `/api/reconcile` | `ContainerOrchestrator::reconcile` |
//! | GET | `/api/events?container_id=&type=` | event bus as SSE |
//!
//! Deployment and teardown answer with their report in every case. The
//! HTTP status mirrors the report status (`in_progress` is 409, `failed`
//! is 502) but clients should read the `status` field.

use crate::application::orchestrator::{ContainerOrchestrator, OrchestratorError};
use crate::application::router::RequestRouter;
use crate::domain::artifact::{Artifact, BatchCommand, RuntimeClientError};
use crate::domain::container::{ContainerId, ReleaseId, RulesetId, TenantId};
use crate::domain::deployment::{DeploymentReport, DeploymentRequest, DeploymentStatus};
use crate::infrastructure::event_bus::{EventBus, EventFilter};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

pub const ROUTE_TARGET_HEADER: &str = "x-rulefleet-route";
pub const ROUTE_ENDPOINT_HEADER: &str = "x-rulefleet-endpoint";

pub struct AppState {
    pub orchestrator: Arc<dyn ContainerOrchestrator>,
    pub router: Arc<RequestRouter>,
    pub event_bus: Arc<EventBus>,
    pub start_time: Instant,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/deployments", post(deploy))
        .route("/api/containers", get(list_containers))
        .route("/api/containers/{id}", get(get_container).delete(teardown))
        .route("/api/containers/{id}/history", get(history))
        .route("/api/containers/{id}/resolve", get(resolve))
        .route("/api/containers/{id}/evaluate", post(evaluate))
        .route("/api/reconcile", post(reconcile))
        .route("/api/events", get(stream_events))
        .with_state(Arc::new(state))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Registry(e) => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "REGISTRY", e.to_string()),
            OrchestratorError::Platform(e) => Self::new(StatusCode::BAD_GATEWAY, "PLATFORM", e.to_string()),
        }
    }
}

impl From<RuntimeClientError> for ApiError {
    fn from(err: RuntimeClientError) -> Self {
        match err {
            RuntimeClientError::UnitNotFound(_) => Self::new(StatusCode::NOT_FOUND, "UNIT_NOT_FOUND", err.to_string()),
            other => Self::new(StatusCode::BAD_GATEWAY, "RUNTIME", other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> ApiResult<ContainerId> {
    ContainerId::parse(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

fn status_code(status: DeploymentStatus) -> StatusCode {
    match status {
        DeploymentStatus::Success | DeploymentStatus::Partial | DeploymentStatus::NoOp => StatusCode::OK,
        DeploymentStatus::InProgress => StatusCode::CONFLICT,
        DeploymentStatus::Failed => StatusCode::BAD_GATEWAY,
    }
}

/// A deploy whose outcome reached the registry is answered 200 even when a
/// step failed; callers read `status` and `steps`.
fn deploy_status_code(report: &DeploymentReport) -> StatusCode {
    match report.status {
        DeploymentStatus::InProgress => StatusCode::CONFLICT,
        _ if report.is_recorded() => StatusCode::OK,
        _ => StatusCode::BAD_GATEWAY,
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "default_endpoint": state.router.default_endpoint(),
    }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSourceKind {
    #[default]
    Inline,
    DefaultEnvironment,
}

/// Body of `POST /api/deployments`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployBody {
    pub tenant_id: String,
    pub ruleset_id: String,
    pub release: ReleaseId,
    #[serde(default)]
    pub document_hash: Option<String>,
    #[serde(default)]
    pub source: ArtifactSourceKind,
    /// Base64 KJAR bytes, required for inline sources
    #[serde(default)]
    pub jar: Option<String>,
    /// Base64 POM bytes, required for inline sources
    #[serde(default)]
    pub pom: Option<String>,
}

impl DeployBody {
    fn into_request(self) -> ApiResult<DeploymentRequest> {
        if self.tenant_id.trim().is_empty() || self.ruleset_id.trim().is_empty() {
            return Err(ApiError::bad_request("tenant_id and ruleset_id are required"));
        }
        let artifact = match self.source {
            ArtifactSourceKind::DefaultEnvironment => Artifact::in_default_environment(self.release),
            ArtifactSourceKind::Inline => {
                let decode = |field: &str, value: Option<String>| -> ApiResult<Vec<u8>> {
                    let value = value.ok_or_else(|| ApiError::bad_request(format!("{} is required for inline artifacts", field)))?;
                    BASE64
                        .decode(value.as_bytes())
                        .map_err(|e| ApiError::bad_request(format!("{} is not valid base64: {}", field, e)))
                };
                let jar = decode("jar", self.jar)?;
                let pom = decode("pom", self.pom)?;
                Artifact::inline(self.release, jar, pom)
            }
        };
        // Inline artifacts without an explicit hash are keyed on their content
        let document_hash = self.document_hash.or_else(|| artifact.content_hash());

        Ok(DeploymentRequest {
            tenant_id: TenantId::new(self.tenant_id),
            ruleset_id: RulesetId::new(self.ruleset_id),
            artifact,
            document_hash,
        })
    }
}

async fn deploy(State(state): State<Arc<AppState>>, Json(body): Json<DeployBody>) -> ApiResult<Response> {
    let request = body.into_request()?;
    let report = state.orchestrator.deploy(request).await;
    Ok((deploy_status_code(&report), Json(report)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let records = state.orchestrator.list(query.all).await?;
    Ok(Json(records).into_response())
}

async fn get_container(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Response> {
    let container_id = parse_id(&id)?;
    let record = state
        .orchestrator
        .get(&container_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("container {} not found", container_id)))?;
    Ok(Json(record).into_response())
}

async fn teardown(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Response> {
    let container_id = parse_id(&id)?;
    let report = state.orchestrator.teardown(&container_id).await?;
    Ok((status_code(report.status), Json(report)).into_response())
}

async fn history(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Response> {
    let container_id = parse_id(&id)?;
    let entries = state.orchestrator.history(&container_id).await?;
    Ok(Json(entries).into_response())
}

async fn resolve(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Response> {
    let container_id = parse_id(&id)?;
    Ok(Json(state.router.resolve(&container_id).await).into_response())
}

/// Body of `POST /api/containers/{id}/evaluate`: either a single applicant
/// fact or raw KIE commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluateBody {
    #[serde(default)]
    pub applicant: Option<Value>,
    #[serde(default)]
    pub commands: Option<Vec<Value>>,
}

async fn evaluate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EvaluateBody>,
) -> ApiResult<Response> {
    let container_id = parse_id(&id)?;
    let batch = match (body.applicant, body.commands) {
        (Some(applicant), None) => BatchCommand::for_applicant(applicant),
        (None, Some(commands)) if !commands.is_empty() => BatchCommand { lookup: None, commands },
        _ => return Err(ApiError::bad_request("provide exactly one of applicant or commands")),
    };

    let (resolution, payload) = state.router.evaluate(&container_id, &batch).await?;
    let mut response = Json(payload).into_response();
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(ROUTE_TARGET_HEADER),
        HeaderValue::from_static(resolution.target.as_str()),
    );
    if let Ok(endpoint) = HeaderValue::from_str(&resolution.endpoint) {
        headers.insert(HeaderName::from_static(ROUTE_ENDPOINT_HEADER), endpoint);
    }
    Ok(response)
}

async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let report = state.orchestrator.reconcile().await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    container_id: Option<String>,
    /// Comma separated event names
    #[serde(rename = "type")]
    kinds: Option<String>,
}

async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let filter = EventFilter {
        container_id: query.container_id.as_deref().map(parse_id).transpose()?,
        kinds: query
            .kinds
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };

    let stream = BroadcastStream::new(state.event_bus.raw_receiver()).filter_map(move |item| {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "SSE subscriber lagged");
                return None;
            }
        };
        if !filter.matches(&event) {
            return None;
        }
        let data = serde_json::to_string(&event).unwrap_or_default();
        Some(Ok(Event::default().event(event.name()).data(data)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::orchestrator::StandardContainerOrchestrator;
    use crate::domain::container::Platform;
    use crate::domain::node_config::{DeploymentConfig, FleetConfigSpec};
    use crate::infrastructure::kie_server::MockRuleRuntime;
    use crate::infrastructure::platform::MockPlatformDriver;
    use crate::infrastructure::repositories::InMemoryContainerRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app() -> Router {
        test_app_with_mocks().0
    }

    fn test_app_with_mocks() -> (Router, Arc<MockPlatformDriver>, Arc<MockRuleRuntime>) {
        let mut spec = FleetConfigSpec::default();
        spec.deployment = DeploymentConfig {
            probe_base_delay: Duration::from_millis(1),
            probe_max_delay: Duration::from_millis(5),
            activation_timeout: Duration::from_millis(200),
            ..DeploymentConfig::default()
        };
        let registry = Arc::new(InMemoryContainerRegistry::new());
        let driver = Arc::new(
            MockPlatformDriver::new(Platform::Local)
                .with_static_environment(&spec.default_environment.name, &spec.default_environment.endpoint),
        );
        let runtime = Arc::new(MockRuleRuntime::new());
        let bus = Arc::new(EventBus::with_default_capacity());

        let orchestrator = Arc::new(StandardContainerOrchestrator::new(
            registry.clone(),
            driver.clone(),
            runtime.clone(),
            bus.clone(),
            &spec,
        ));
        let router = Arc::new(RequestRouter::new(
            registry,
            driver.clone(),
            runtime.clone(),
            bus.clone(),
            spec.default_environment.endpoint.clone(),
        ));
        let app = app(AppState {
            orchestrator,
            router,
            event_bus: bus,
            start_time: Instant::now(),
        });
        (app, driver, runtime)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn deploy_request(hash: &str) -> Request<Body> {
        let body = json!({
            "tenant_id": "chase",
            "ruleset_id": "insurance",
            "release": { "group_id": "com.underwriting", "artifact_id": "chase-insurance", "version": "1.0.0" },
            "document_hash": hash,
            "jar": BASE64.encode(b"jar-bytes"),
            "pom": BASE64.encode(b"<project/>"),
        });
        Request::builder()
            .method("POST")
            .uri("/api/deployments")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_deploy_then_get_and_resolve() {
        let app = test_app();

        let response = app.clone().oneshot(deploy_request("h1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["status"], "success");
        assert_eq!(report["container_id"], "chase-insurance-underwriting-rules");
        assert_eq!(report["version"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/containers/chase-insurance-underwriting-rules")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "running");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/containers/chase-insurance-underwriting-rules/resolve")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let resolution = body_json(response).await;
        assert_eq!(resolution["target"], "dedicated");
        assert_eq!(resolution["endpoint"], "http://localhost:8081");
    }

    #[tokio::test]
    async fn test_recorded_deploy_with_failed_activations_is_200_partial() {
        let (app, _, runtime) = test_app_with_mocks();
        runtime.fail_units_at("http://drools:8080");
        runtime.fail_units_at("http://localhost:8081");

        let response = app.oneshot(deploy_request("h1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let report = body_json(response).await;
        assert_eq!(report["status"], "partial");
        assert_eq!(report["steps"]["create"]["status"], "success");
        assert_eq!(report["steps"]["activate"]["status"], "failed");
        assert_eq!(report["steps"]["registry_update"]["status"], "success");
    }

    #[tokio::test]
    async fn test_failed_teardown_is_structured() {
        let (app, driver, _) = test_app_with_mocks();
        app.clone().oneshot(deploy_request("h1")).await.unwrap();
        driver.set_delete_failure(true);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/containers/chase-insurance-underwriting-rules")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let report = body_json(response).await;
        assert_eq!(report["status"], "failed");
        assert_eq!(report["failure"], "platform_error");
    }

    #[tokio::test]
    async fn test_inline_deploy_requires_jar() {
        let body = json!({
            "tenant_id": "chase",
            "ruleset_id": "insurance",
            "release": { "group_id": "g", "artifact_id": "a", "version": "1" },
        });
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/deployments")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_container_is_404_but_resolves_to_default() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/containers/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::builder().uri("/api/containers/nope/resolve").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let resolution = body_json(response).await;
        assert_eq!(resolution["target"], "fallback");
        assert_eq!(resolution["endpoint"], "http://drools:8080");
    }

    #[tokio::test]
    async fn test_teardown_unknown_is_no_op() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/containers/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "no_op");
    }

    #[tokio::test]
    async fn test_evaluate_sets_route_headers() {
        let app = test_app();
        app.clone().oneshot(deploy_request("h1")).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/containers/chase-insurance-underwriting-rules/evaluate")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "applicant": { "age": 30 } }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ROUTE_TARGET_HEADER], "dedicated");
        assert_eq!(body_json(response).await["type"], "SUCCESS");
    }
}
