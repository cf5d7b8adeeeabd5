// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Rule artifacts and the rule runtime port.
//!
//! An artifact is a compiled KJAR plus its POM, addressed by Maven
//! coordinates. The runtime (a KIE server) loads it as a named unit whose
//! name is the container id.

use crate::domain::container::{ContainerId, ReleaseId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Where the artifact bytes come from
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// Bytes supplied with the deploy request
    Inline { jar: Bytes, pom: Bytes },
    /// Already installed in the default environment's repository by the
    /// build pipeline
    DefaultEnvironment,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub release: ReleaseId,
    pub source: ArtifactSource,
}

impl Artifact {
    pub fn inline(release: ReleaseId, jar: impl Into<Bytes>, pom: impl Into<Bytes>) -> Self {
        Self {
            release,
            source: ArtifactSource::Inline {
                jar: jar.into(),
                pom: pom.into(),
            },
        }
    }

    pub fn in_default_environment(release: ReleaseId) -> Self {
        Self {
            release,
            source: ArtifactSource::DefaultEnvironment,
        }
    }

    /// Hex sha256 of the jar when the bytes are known.
    pub fn content_hash(&self) -> Option<String> {
        match &self.source {
            ArtifactSource::Inline { jar, .. } => Some(hex::encode(Sha256::digest(jar))),
            ArtifactSource::DefaultEnvironment => None,
        }
    }
}

/// Lifecycle of a unit as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    Creating,
    Started,
    Failed,
    Disposing,
    Deactivated,
    Other(String),
}

impl UnitState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATING" => Self::Creating,
            "STARTED" => Self::Started,
            "FAILED" => Self::Failed,
            "DISPOSING" => Self::Disposing,
            "DEACTIVATED" => Self::Deactivated,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub state: UnitState,
    pub release: Option<ReleaseId>,
}

/// Outcome of asking a runtime to load a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Created,
    /// The unit existed with the requested release already
    AlreadyLoaded,
    /// The unit existed with another release and was moved to the new one
    Upgraded { previous: Option<ReleaseId> },
}

// ============================================================================
// Batch commands
// ============================================================================

/// Fully qualified fact type the underwriting rules match on
pub const APPLICANT_FACT_TYPE: &str = "com.underwriting.rules.Applicant";

/// KIE batch-execution payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCommand {
    pub lookup: Option<String>,
    pub commands: Vec<Value>,
}

impl BatchCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, fact_type: &str, fact: Value, out_identifier: &str) -> Self {
        self.commands.push(json!({
            "insert": {
                "object": { fact_type: fact },
                "out-identifier": out_identifier,
                "return-object": true,
            }
        }));
        self
    }

    pub fn fire_all_rules(mut self) -> Self {
        self.commands.push(json!({ "fire-all-rules": { "max": -1 } }));
        self
    }

    pub fn get_objects(mut self, out_identifier: &str) -> Self {
        self.commands
            .push(json!({ "get-objects": { "out-identifier": out_identifier } }));
        self
    }

    /// Insert an applicant, fire every rule and collect all facts.
    pub fn for_applicant(applicant: Value) -> Self {
        Self::new()
            .insert(APPLICANT_FACT_TYPE, applicant, "applicant")
            .fire_all_rules()
            .get_objects("all-facts")
    }
}

// ============================================================================
// Runtime port
// ============================================================================

#[async_trait]
pub trait RuleRuntimeClient: Send + Sync {
    /// Ask the runtime at `endpoint` to load `release` as unit `unit_id`.
    async fn load_unit(
        &self,
        endpoint: &str,
        unit_id: &ContainerId,
        release: &ReleaseId,
    ) -> Result<LoadOutcome, RuntimeClientError>;

    async fn unit_status(&self, endpoint: &str, unit_id: &ContainerId) -> Result<UnitInfo, RuntimeClientError>;

    /// Execute a batch against a loaded unit and return the raw decision payload.
    async fn evaluate(
        &self,
        endpoint: &str,
        unit_id: &ContainerId,
        batch: &BatchCommand,
    ) -> Result<Value, RuntimeClientError>;
}

#[derive(Debug, Error)]
pub enum RuntimeClientError {
    #[error("Runtime unreachable at {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("Runtime rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unit {0} not found")]
    UnitNotFound(String),

    #[error("Invalid runtime response: {0}")]
    InvalidResponse(String),
}
