// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod repositories;
pub mod platform;
pub mod db;
pub mod event_bus;
pub mod kie_server;

pub use kie_server::{KieServerClient, MockRuleRuntime};
pub use platform::{MockFailure, MockPlatformDriver};
