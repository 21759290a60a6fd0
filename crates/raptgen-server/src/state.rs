//! Shared application state.

use raptgen_runtime::Orchestrator;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}
