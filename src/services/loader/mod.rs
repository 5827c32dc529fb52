// File ingestion: bytes of a declared or sniffed format into a TabularBuffer
pub mod csv;
pub mod excel;
pub mod json;
pub mod parquet;

use bytes::Bytes;
use std::collections::HashSet;
use std::path::Path;

use crate::api::middleware::AppError;
use crate::models::TabularBuffer;

/// Supported upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Excel,
    Json,
    Parquet,
}

impl FileFormat {
    /// Resolve a declared format name or a bare file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().trim_start_matches('.').to_lowercase().as_str() {
            "csv" => Some(FileFormat::Csv),
            "excel" | "xls" | "xlsx" | "xlsm" | "xlsb" | "ods" => Some(FileFormat::Excel),
            "json" => Some(FileFormat::Json),
            "parquet" => Some(FileFormat::Parquet),
            _ => None,
        }
    }

    /// Declared extension wins; otherwise sniff it from the filename
    pub fn detect(declared: Option<&str>, filename: Option<&str>) -> Result<Self, AppError> {
        if let Some(declared) = declared.filter(|d| !d.trim().is_empty()) {
            return Self::from_extension(declared)
                .ok_or_else(|| AppError::UnsupportedFormat(format!("Unsupported file type: {}", declared)));
        }

        let filename = filename.ok_or_else(|| {
            AppError::UnsupportedFormat("No file type declared and no filename to detect it from".to_string())
        })?;
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| AppError::UnsupportedFormat(format!("Unsupported file type: {}", filename)))
    }
}

pub struct FileLoader;

impl FileLoader {
    /// Parse an uploaded byte stream and normalize its column names
    pub fn load(
        bytes: &[u8],
        declared_extension: Option<&str>,
        filename: Option<&str>,
    ) -> Result<TabularBuffer, AppError> {
        let format = FileFormat::detect(declared_extension, filename)?;
        tracing::debug!("Loading {} bytes as {:?}", bytes.len(), format);

        let mut columns = match format {
            FileFormat::Csv => csv::read_csv(bytes)?,
            FileFormat::Excel => excel::read_excel(bytes)?,
            FileFormat::Json => json::read_json(bytes)?,
            FileFormat::Parquet => parquet::read_parquet(bytes)?,
        };

        let raw_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        for (column, name) in columns.iter_mut().zip(normalize_column_names(&raw_names)) {
            column.name = name;
        }
        let buffer = TabularBuffer::new(columns)?;

        tracing::info!(
            "Loaded {:?} file with {} rows and {} columns",
            format,
            buffer.row_count(),
            buffer.column_count()
        );
        Ok(buffer)
    }

    /// Read a file from disk, detecting the format from its extension
    pub fn load_path(path: &Path, declared_extension: Option<&str>) -> Result<TabularBuffer, AppError> {
        let bytes = std::fs::read(path)
            .map_err(|e| AppError::Parse(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::load(&bytes, declared_extension, path.to_str())
    }

    /// Parse on the blocking pool so large files don't stall request handling
    pub async fn load_blocking(
        bytes: Bytes,
        declared_extension: Option<String>,
        filename: Option<String>,
    ) -> Result<TabularBuffer, AppError> {
        tokio::task::spawn_blocking(move || {
            Self::load(&bytes, declared_extension.as_deref(), filename.as_deref())
        })
        .await?
    }
}

/// Make column names SQL-friendly and unique.
///
/// Every character outside `[A-Za-z0-9]` becomes `_` and the result is
/// lowercased. Collisions get `_1`, `_2`, ... in order of first occurrence.
pub fn normalize_column_names(names: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(names.len());
    let mut normalized = Vec::with_capacity(names.len());

    for (idx, name) in names.iter().enumerate() {
        let base = if name.trim().is_empty() {
            format!("column_{}", idx)
        } else {
            name.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect()
        };

        let mut candidate = base.clone();
        let mut counter = 1;
        while seen.contains(&candidate) {
            candidate = format!("{}_{}", base, counter);
            counter += 1;
        }
        seen.insert(candidate.clone());
        normalized.push(candidate);
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_normalize_column_names() {
        assert_eq!(
            normalize_column_names(&names(&["First Name", "E-mail", "Amount ($)"])),
            names(&["first_name", "e_mail", "amount____"])
        );
    }

    #[test]
    fn test_normalize_collisions() {
        assert_eq!(
            normalize_column_names(&names(&["a b", "a-b", "A_B", "a_b_1"])),
            names(&["a_b", "a_b_1", "a_b_2", "a_b_1_1"])
        );
    }

    #[test]
    fn test_normalize_non_ascii_and_blank() {
        assert_eq!(normalize_column_names(&names(&["Größe", ""])), names(&["gr__e", "column_1"]));
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(FileFormat::detect(None, Some("Sales.XLSX")).unwrap(), FileFormat::Excel);
        assert_eq!(FileFormat::detect(Some(".json"), Some("data.csv")).unwrap(), FileFormat::Json);
        assert_eq!(FileFormat::detect(Some("excel"), None).unwrap(), FileFormat::Excel);
        assert!(matches!(
            FileFormat::detect(None, Some("notes.txt")),
            Err(AppError::UnsupportedFormat(_))
        ));
        assert!(matches!(FileFormat::detect(None, None), Err(AppError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let result = FileLoader::load(b"a,b\n1,2\n", Some("xml"), None);
        assert!(matches!(result, Err(AppError::UnsupportedFormat(_))));
    }

    #[tokio::test]
    async fn test_load_blocking_normalizes_names() {
        let buffer = FileLoader::load_blocking(
            Bytes::from_static(b"Order ID,Order-ID\n1,2\n"),
            None,
            Some("orders.csv".to_string()),
        )
        .await
        .unwrap();
        assert_eq!(buffer.column_names(), vec!["order_id", "order_id_1"]);
    }
}
