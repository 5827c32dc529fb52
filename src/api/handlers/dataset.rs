use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{DatasetQueryRequest, QueryResult};

#[derive(Debug, Deserialize)]
pub struct PreviewParams {
    pub limit: Option<u64>,
}

/// Preview a dataset: filtered rows, bounded by the clamped limit.
/// A `?limit=` query parameter overrides the body's limit.
pub async fn preview_dataset(
    State(state): State<AppState>,
    Query(params): Query<PreviewParams>,
    Json(mut payload): Json<DatasetQueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    if params.limit.is_some() {
        payload.limit = params.limit;
    }
    tracing::info!("Previewing dataset on {} source", payload.source.kind);
    let result = state.engine.preview(&payload).await?;
    Ok(Json(result))
}

/// Chart data: filters plus optional aggregation
pub async fn query_dataset(
    State(state): State<AppState>,
    Json(payload): Json<DatasetQueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    tracing::info!(
        "Querying dataset on {} source{}",
        payload.source.kind,
        if payload.aggregation.is_some() { " with aggregation" } else { "" }
    );
    let result = state.engine.query(&payload).await?;
    Ok(Json(result))
}
