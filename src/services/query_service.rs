// Engine context: the process-level owner of the connection manager, and
// the ingest / preview / query operations built on the pure components.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{
    AggregationSpec, ConnectionDescriptor, DatasetQueryRequest, IngestionReport, QueryResult, TabularBuffer,
};
use crate::services::connection_manager::{ConnectionManager, PoolStatus};
use crate::services::database::adapter::timeout_error;
use crate::services::database::{BackingStore, ConnectionHandle, RegisteredTable, SourceKind};
use crate::services::loader::FileLoader;
use crate::services::pii_detector::PiiDetector;
use crate::services::query_builder::{clamp_limit, QueryBuilder};
use crate::services::query_executor::QueryExecutor;
use crate::services::schema_inferencer::{InferenceOptions, SchemaInferencer};

/// Rows echoed back in an ingestion report
const SAMPLE_ROWS: usize = 5;

/// Explicitly constructed at startup and shut down at exit
pub struct EngineContext {
    config: Config,
    connections: Arc<ConnectionManager>,
    executor: QueryExecutor,
}

impl EngineContext {
    pub fn new(config: Config) -> Self {
        let connections = Arc::new(
            ConnectionManager::with_config(config.pool.max_size, config.query.connect_retries)
                .with_eviction(config.pool.max_pools, config.pool_idle_timeout())
                .with_data_root(&config.data.root),
        );
        Self {
            config,
            connections,
            executor: QueryExecutor::new(),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down engine context");
        self.connections.shutdown().await;
    }

    /// Await `work` within the query timeout
    async fn bounded<T>(&self, work: impl Future<Output = Result<T, AppError>>) -> Result<T, AppError> {
        let timeout = self.config.query_timeout();
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| timeout_error(timeout))?
    }

    /// Check out a handle, waiting at most the query timeout for a free slot
    async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<ConnectionHandle, AppError> {
        self.bounded(self.connections.acquire(descriptor)).await
    }

    fn inference_options(&self) -> InferenceOptions {
        InferenceOptions {
            sample_size: self.config.inference.sample_size,
            seed: self.config.inference.seed,
        }
    }

    /// Parse an upload, then infer its schema and flag PII concurrently
    pub async fn ingest(
        &self,
        bytes: Bytes,
        filename: Option<String>,
        format: Option<String>,
    ) -> Result<(IngestionReport, Arc<TabularBuffer>), AppError> {
        let size = bytes.len();
        let buffer = Arc::new(FileLoader::load_blocking(bytes, format, filename.clone()).await?);

        let inferencer = SchemaInferencer::new(self.inference_options());
        let detector = PiiDetector::new(self.config.inference.sample_size);
        let (schema, pii) = futures::future::try_join(
            tokio::task::spawn_blocking({
                let buffer = buffer.clone();
                move || inferencer.infer(&buffer)
            }),
            tokio::task::spawn_blocking({
                let buffer = buffer.clone();
                move || detector.detect(&buffer)
            }),
        )
        .await?;

        tracing::info!(
            "Ingested {} ({} bytes): {} rows, {} columns, {} PII columns",
            filename.as_deref().unwrap_or("upload"),
            size,
            buffer.row_count(),
            buffer.column_count(),
            pii.len()
        );

        let report = IngestionReport {
            filename,
            row_count: buffer.row_count(),
            column_count: buffer.column_count(),
            schema,
            pii_columns: pii.columns(),
            pii_details: pii.matches,
            sample_rows: buffer.json_rows(SAMPLE_ROWS),
        };
        Ok((report, buffer))
    }

    /// Save a buffer as a table of an embedded source
    pub async fn save_to_embedded(
        &self,
        descriptor: &ConnectionDescriptor,
        table_name: Option<&str>,
        buffer: &TabularBuffer,
    ) -> Result<RegisteredTable, AppError> {
        let handle = self.acquire(descriptor).await?;
        let embedded = handle.as_embedded().ok_or_else(|| {
            AppError::UnsupportedSourceKind(format!(
                "Tables can only be saved to embedded sources, not {}",
                handle.kind().as_str()
            ))
        })?;
        let table = embedded.register_buffer(table_name, buffer);
        self.connections.release(handle);
        table
    }

    /// Bounded rows of a dataset, filters applied, no aggregation
    pub async fn preview(&self, request: &DatasetQueryRequest) -> Result<QueryResult, AppError> {
        self.run_with_retry(request, None).await
    }

    /// Chart data: filters plus the request's aggregation, when given
    pub async fn query(&self, request: &DatasetQueryRequest) -> Result<QueryResult, AppError> {
        self.run_with_retry(request, request.aggregation.as_ref()).await
    }

    /// Round-trip to the store behind a descriptor
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> Result<Option<PoolStatus>, AppError> {
        let mut handle = self.acquire(descriptor).await?;
        self.bounded(handle.test_connection()).await?;
        self.connections.release(handle);
        Ok(self.connections.pool_status(descriptor).await)
    }

    async fn run_with_retry(
        &self,
        request: &DatasetQueryRequest,
        aggregation: Option<&AggregationSpec>,
    ) -> Result<QueryResult, AppError> {
        let mut attempt = 0;
        loop {
            match self.run_once(request, aggregation).await {
                Err(e) if e.is_transient() && attempt < self.config.query.connect_retries => {
                    attempt += 1;
                    tracing::warn!("Retrying query after connection error: {}", e);
                }
                outcome => return outcome,
            }
        }
    }

    async fn run_once(
        &self,
        request: &DatasetQueryRequest,
        aggregation: Option<&AggregationSpec>,
    ) -> Result<QueryResult, AppError> {
        let kind: SourceKind = request.source.kind.parse()?;
        let limit = clamp_limit(
            request.limit,
            self.config.query.preview_limit,
            self.config.query.max_limit,
        );
        let builder = QueryBuilder::new()
            .with_dialect(kind.sql_dialect())
            .with_limit(limit);

        // Reject bad definitions before touching the store
        let source = builder.resolve_source(&request.dataset)?;

        let mut handle = self.acquire(&request.source).await?;
        let allowed = match request.dataset.known_columns() {
            Some(columns) => columns,
            None => self.bounded(handle.probe_columns(&source)).await?,
        };
        let query = builder
            .with_allowed_columns(allowed)
            .build(&request.dataset, &request.filters, aggregation)?;

        let result = self
            .executor
            .execute(&mut handle, &query, self.config.query_timeout())
            .await;
        self.connections.release(handle);
        result
    }
}
