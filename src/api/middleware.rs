use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
///
/// Every failure of the ingestion and query core is one of these kinds. The
/// orchestration layer only ever sees the kind code and a message, never a
/// raw driver error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported source kind: {0}")]
    UnsupportedSourceKind(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid dataset definition: {0}")]
    InvalidDatasetDefinition(String),

    #[error("Empty aggregation: {0}")]
    EmptyAggregation(String),

    #[error("Non-SELECT query: {0}")]
    NonSelectQuery(String),

    #[error("Invalid column reference: {0}")]
    InvalidColumnReference(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            AppError::Parse(_) => "PARSE_ERROR",
            AppError::UnsupportedSourceKind(_) => "UNSUPPORTED_SOURCE_KIND",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::InvalidDatasetDefinition(_) => "INVALID_DATASET_DEFINITION",
            AppError::EmptyAggregation(_) => "EMPTY_AGGREGATION",
            AppError::NonSelectQuery(_) => "NON_SELECT_QUERY",
            AppError::InvalidColumnReference(_) => "INVALID_COLUMN_REFERENCE",
            AppError::QueryExecution(_) => "QUERY_EXECUTION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a retry of the same idempotent operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::Connection(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Parse(_)
            | AppError::UnsupportedSourceKind(_)
            | AppError::InvalidDatasetDefinition(_)
            | AppError::EmptyAggregation(_)
            | AppError::NonSelectQuery(_)
            | AppError::InvalidColumnReference(_)
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::QueryExecution(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::UnsupportedFormat(msg)
            | AppError::Parse(msg)
            | AppError::UnsupportedSourceKind(msg)
            | AppError::Connection(msg)
            | AppError::InvalidDatasetDefinition(msg)
            | AppError::EmptyAggregation(msg)
            | AppError::NonSelectQuery(msg)
            | AppError::InvalidColumnReference(msg)
            | AppError::QueryExecution(msg)
            | AppError::Validation(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut detail = ErrorDetail::new(self.code(), self.message());

        match &self {
            AppError::NonSelectQuery(_) => {
                detail = detail.with_details("Only a single read-only SELECT statement is allowed.");
            }
            AppError::InvalidColumnReference(_) => {
                detail = detail.with_details(
                    "Column names must be plain identifiers that exist in the dataset schema.",
                );
            }
            AppError::QueryExecution(msg) if msg.contains("timeout") => {
                detail = detail.with_details(
                    "Consider adding filters or lowering the row limit.",
                );
            }
            _ => {}
        }

        if status.is_server_error() {
            tracing::error!("{}: {}", detail.code, detail.message);
        }

        (status, Json(ErrorResponse { error: detail })).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<datafusion::error::DataFusionError> for AppError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        AppError::QueryExecution(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Background task failed: {}", err))
    }
}
