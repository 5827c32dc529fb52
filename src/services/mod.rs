pub mod connection_manager; // Per-fingerprint pools and live-handle limits
pub mod database; // Backing stores: postgres, mysql, embedded, file
pub mod datafusion; // Embedded analytical engine
pub mod loader; // File ingestion
pub mod pii_detector;
pub mod query_builder;
pub mod query_executor;
pub mod query_service;
pub mod schema_inferencer;

pub use connection_manager::{ConnectionManager, PoolStatus};
pub use loader::{FileFormat, FileLoader};
pub use pii_detector::PiiDetector;
pub use query_builder::{BuiltQuery, QueryBuilder};
pub use query_executor::QueryExecutor;
pub use query_service::EngineContext;
pub use schema_inferencer::{InferenceOptions, SchemaInferencer};
