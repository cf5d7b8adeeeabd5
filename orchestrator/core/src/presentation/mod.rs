// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`rulefleet-core`)
//!
//! HTTP surface that translates external requests into application
//! service calls. No business logic lives here; all real work is
//! delegated to services in `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP/SSE (Axum) | REST endpoints + Server-Sent Events for container lifecycle events |

pub mod api;
