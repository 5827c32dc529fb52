use axum::{
    extract::{Query, State},
    Json,
};
use bytes::Bytes;
use serde::Serialize;

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::{ConnectionDescriptor, IngestParams, IngestionReport};
use crate::services::database::RegisteredTable;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    #[serde(flatten)]
    pub report: IngestionReport,
    /// Set when the upload was also saved with `save_as`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<RegisteredTable>,
}

/// Ingest an uploaded file: raw bytes in the body, name and format as query
/// parameters
pub async fn ingest_file(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    if body.is_empty() {
        return Err(AppError::Validation("Uploaded file is empty".to_string()));
    }
    tracing::info!(
        "Ingesting upload {} ({} bytes)",
        params.filename.as_deref().unwrap_or("<unnamed>"),
        body.len()
    );

    let (report, buffer) = state
        .engine
        .ingest(body, params.filename.clone(), params.format.clone())
        .await?;

    let table = match params.save_as.as_deref() {
        Some(name) => Some(
            state
                .engine
                .save_to_embedded(&ConnectionDescriptor::new("embedded"), Some(name), &buffer)
                .await?,
        ),
        None => None,
    };

    Ok(Json(IngestResponse { report, table }))
}
