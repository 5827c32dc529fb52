use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::ConnectionDescriptor;

/// Test that a data source is reachable, and report its pool
pub async fn test_source(
    State(state): State<AppState>,
    Json(descriptor): Json<ConnectionDescriptor>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("Testing {} source ({})", descriptor.kind, descriptor.fingerprint());
    let pool = state.engine.test_connection(&descriptor).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "pool": pool,
    })))
}
