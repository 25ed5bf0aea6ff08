use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::hearing::orchestrator::HearingRunner;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    /// Stateless across runs; one pipeline serves every session.
    /// Default: `HearingPipeline<LlmChains>`.
    pub pipeline: Arc<dyn HearingRunner>,
    pub config: Config,
}
