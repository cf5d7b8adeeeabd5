// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Aggregates, value objects and ports of the rule container fleet.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Container lifecycle model, platform and runtime ports,
//!   registry contract, deployment reports and fleet configuration

pub mod container;
pub mod platform;
pub mod artifact;
pub mod deployment;
pub mod repository;
pub mod events;
pub mod node_config;
