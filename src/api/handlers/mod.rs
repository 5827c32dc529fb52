pub mod dataset;
pub mod ingest;
pub mod source;

use std::sync::Arc;

use crate::services::EngineContext;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EngineContext>,
}
