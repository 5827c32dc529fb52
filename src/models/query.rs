use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::schema::SemanticType;

/// Uniform tabular result of a preview or aggregation query
///
/// Serialized as `{columns, rows, total_rows, ...}`, the shape chart
/// renderers already consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub column_types: Vec<SemanticType>,
    pub rows: Vec<Vec<Value>>,
    #[serde(rename = "total_rows")]
    pub row_count: usize,
    /// True when the row limit cut off further rows
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Values of one output column, by name
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

/// Query parameters of an upload
#[derive(Debug, Default, Deserialize)]
pub struct IngestParams {
    pub filename: Option<String>,
    /// Declared format; sniffed from `filename` when absent
    pub format: Option<String>,
    /// Also save the rows as this table in the shared in-memory embedded source
    pub save_as: Option<String>,
}
