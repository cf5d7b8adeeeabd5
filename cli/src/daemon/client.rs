// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with daemon API

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use rulefleet_core::domain::container::{ContainerId, ContainerRecord, DeploymentHistoryEntry};
use rulefleet_core::domain::deployment::{
    DeploymentReport, ReconciliationReport, Resolution, RouteTarget, TeardownReport,
};
use rulefleet_core::presentation::api::{DeployBody, EvaluateBody, ROUTE_ENDPOINT_HEADER, ROUTE_TARGET_HEADER};

use super::base_url;

/// Payload returned by the rule runtime plus where it was served from
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub target: Option<RouteTarget>,
    pub endpoint: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        // No global timeout: deployments wait for environment creation
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-success response into an error carrying the API's message.
    async fn check(response: Response, what: &str) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => anyhow::bail!("{} failed ({} {}): {}", what, status, body.code, body.message),
            Err(_) => anyhow::bail!("{} failed ({}): {}", what, status, text),
        }
    }

    async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// Deployment reports come back on 200, 409 and 502 alike.
    async fn report<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        match response.status() {
            StatusCode::OK | StatusCode::CONFLICT | StatusCode::BAD_GATEWAY => {
                let text = response.text().await.context("Failed to read response body")?;
                match serde_json::from_str::<T>(&text) {
                    Ok(report) => Ok(report),
                    Err(_) => match serde_json::from_str::<ErrorBody>(&text) {
                        Ok(body) => anyhow::bail!("{} failed ({}): {}", what, body.code, body.message),
                        Err(e) => Err(e).with_context(|| format!("Failed to parse {} response", what)),
                    },
                }
            }
            _ => {
                Self::check(response, what).await?;
                anyhow::bail!("{} returned an unexpected status", what)
            }
        }
    }

    pub async fn deploy(&self, body: &DeployBody) -> Result<DeploymentReport> {
        let response = self
            .client
            .post(self.url("/api/deployments"))
            .json(body)
            .send()
            .await
            .context("Failed to send deployment")?;
        Self::report(response, "Deployment").await
    }

    pub async fn list_containers(&self, include_inactive: bool) -> Result<Vec<ContainerRecord>> {
        let response = self
            .client
            .get(self.url("/api/containers"))
            .query(&[("all", include_inactive)])
            .send()
            .await
            .context("Failed to list containers")?;
        let response = Self::check(response, "List containers").await?;
        Self::json(response, "list").await
    }

    /// `None` when the daemon has never seen the id.
    pub async fn get_container(&self, container_id: &ContainerId) -> Result<Option<ContainerRecord>> {
        let response = self
            .client
            .get(self.url(&format!("/api/containers/{}", container_id)))
            .send()
            .await
            .context("Failed to get container")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, "Get container").await?;
        Self::json(response, "container").await.map(Some)
    }

    pub async fn history(&self, container_id: &ContainerId) -> Result<Vec<DeploymentHistoryEntry>> {
        let response = self
            .client
            .get(self.url(&format!("/api/containers/{}/history", container_id)))
            .send()
            .await
            .context("Failed to get history")?;
        let response = Self::check(response, "History").await?;
        Self::json(response, "history").await
    }

    pub async fn teardown(&self, container_id: &ContainerId) -> Result<TeardownReport> {
        let response = self
            .client
            .delete(self.url(&format!("/api/containers/{}", container_id)))
            .send()
            .await
            .context("Failed to delete container")?;
        Self::report(response, "Teardown").await
    }

    pub async fn resolve(&self, container_id: &ContainerId) -> Result<Resolution> {
        let response = self
            .client
            .get(self.url(&format!("/api/containers/{}/resolve", container_id)))
            .send()
            .await
            .context("Failed to resolve container")?;
        let response = Self::check(response, "Resolve").await?;
        Self::json(response, "resolve").await
    }

    pub async fn evaluate(&self, container_id: &ContainerId, body: &EvaluateBody) -> Result<EvaluationOutcome> {
        let response = self
            .client
            .post(self.url(&format!("/api/containers/{}/evaluate", container_id)))
            .json(body)
            .send()
            .await
            .context("Failed to send evaluation")?;
        let response = Self::check(response, "Evaluation").await?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let target = header(ROUTE_TARGET_HEADER).and_then(|t| match t.as_str() {
            "dedicated" => Some(RouteTarget::Dedicated),
            "fallback" => Some(RouteTarget::Fallback),
            _ => None,
        });
        let endpoint = header(ROUTE_ENDPOINT_HEADER);
        let payload = Self::json(response, "evaluation").await?;

        Ok(EvaluationOutcome {
            target,
            endpoint,
            payload,
        })
    }

    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let response = self
            .client
            .post(self.url("/api/reconcile"))
            .send()
            .await
            .context("Failed to trigger reconciliation")?;
        let response = Self::check(response, "Reconciliation").await?;
        Self::json(response, "reconciliation").await
    }
}
