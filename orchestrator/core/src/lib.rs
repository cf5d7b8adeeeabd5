// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! rulefleet core
//!
//! Provisions one isolated KIE rule-execution environment per
//! (tenant, rule set) pair, keeps a registry of them in sync with the
//! platform, and routes evaluation traffic.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Domain:** records, reports, platform and runtime ports
//! - **Application:** orchestrator, allocator, deployer, router
//! - **Infrastructure:** Docker/Kubernetes drivers, KIE client, registries
//! - **Presentation:** axum HTTP API

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
