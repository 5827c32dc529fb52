// DataFusion SessionManager
//
// Creates the SessionContext behind an embedded analytical source: an empty
// in-memory instance, or one with the files under a local path registered
// as tables.

use anyhow::{bail, Context, Result};
use datafusion::prelude::*;
use std::path::Path;

use crate::services::loader::normalize_column_names;

/// Configuration for DataFusion sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Batch size for query execution
    pub batch_size: usize,
    /// Number of partitions for parallel execution
    pub target_partitions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            target_partitions: num_cpus::get(),
        }
    }
}

/// File extensions the embedded engine can attach as tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachableFormat {
    Csv,
    Parquet,
    /// Newline-delimited JSON
    Json,
}

impl AttachableFormat {
    fn of(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "parquet" => Some(Self::Parquet),
            "json" | "ndjson" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Manages DataFusion SessionContext lifecycle
///
/// # Example
/// ```rust,ignore
/// let manager = DataFusionSessionManager::new(SessionConfig::default());
/// let session = manager.open(Some(Path::new("/data/warehouse"))).await?;
/// let df = session.sql("SELECT * FROM orders").await?;
/// ```
pub struct DataFusionSessionManager {
    config: SessionConfig,
}

impl DataFusionSessionManager {
    /// Create a new SessionManager with the given configuration
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Create a new SessionManager with default configuration
    pub fn default_config() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Create a new, empty DataFusion SessionContext
    pub fn create_session(&self) -> SessionContext {
        let config = datafusion::execution::config::SessionConfig::new()
            .with_batch_size(self.config.batch_size)
            .with_target_partitions(self.config.target_partitions);

        SessionContext::new_with_config(config)
    }

    /// Open a session, attaching the file or directory at `path` when given.
    ///
    /// Every csv/parquet/json file becomes a table named by its normalized
    /// file stem. Other files in a directory are skipped.
    pub async fn open(&self, path: Option<&Path>) -> Result<SessionContext> {
        let ctx = self.create_session();
        let Some(path) = path else {
            return Ok(ctx);
        };

        if !path.exists() {
            bail!("Path does not exist: {}", path.display());
        }

        let files: Vec<_> = if path.is_dir() {
            let mut entries = std::fs::read_dir(path)
                .with_context(|| format!("Failed to list {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && AttachableFormat::of(p).is_some())
                .collect::<Vec<_>>();
            entries.sort();
            entries
        } else {
            vec![path.to_path_buf()]
        };

        let stems: Vec<String> = files
            .iter()
            .map(|f| {
                f.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();

        for (file, table) in files.iter().zip(normalize_column_names(&stems)) {
            let format = AttachableFormat::of(file)
                .with_context(|| format!("Unsupported file for embedded source: {}", file.display()))?;
            let location = file.to_string_lossy().into_owned();
            match format {
                AttachableFormat::Csv => {
                    ctx.register_csv(table.as_str(), &location, CsvReadOptions::new())
                        .await
                }
                AttachableFormat::Parquet => {
                    ctx.register_parquet(table.as_str(), &location, ParquetReadOptions::default())
                        .await
                }
                AttachableFormat::Json => {
                    ctx.register_json(table.as_str(), &location, NdJsonReadOptions::default())
                        .await
                }
            }
            .with_context(|| format!("Failed to attach {}", file.display()))?;
            tracing::debug!("Attached {} as table '{}'", file.display(), table);
        }

        Ok(ctx)
    }

    /// Get the current configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
