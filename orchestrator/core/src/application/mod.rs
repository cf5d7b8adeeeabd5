// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod port_allocator;
pub mod artifact_deployer;
pub mod orchestrator;
pub mod router;
pub mod reconciliation;

// Re-export services for convenience
pub use orchestrator::{ContainerOrchestrator, OrchestratorError, StandardContainerOrchestrator};
pub use router::RequestRouter;
pub use reconciliation::spawn_reconciliation_loop;
