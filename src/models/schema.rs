use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tabular::StorageType;

/// Semantic type suggested for a column by the schema inferencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Integer,
    Float,
    Boolean,
    Date,
    Timestamp,
    Categorical,
    String,
}

/// Inferred description of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub observed_storage_type: StorageType,
    pub inferred_semantic_type: SemanticType,
    pub nullable: bool,
}

/// Why a column was flagged as PII
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiReason {
    NameKeyword,
    EmailPattern,
    PhonePattern,
    SsnPattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiMatch {
    pub column: String,
    pub reason: PiiReason,
}

/// Columns flagged as likely PII, in buffer column order
///
/// Advisory only. Detection is a keyword and pattern heuristic with known
/// false positives (e.g. `zip` inside `zipper_count`) and false negatives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PiiFlagSet {
    pub matches: Vec<PiiMatch>,
}

impl PiiFlagSet {
    pub fn contains(&self, column: &str) -> bool {
        self.matches.iter().any(|m| m.column == column)
    }

    pub fn reason(&self, column: &str) -> Option<PiiReason> {
        self.matches.iter().find(|m| m.column == column).map(|m| m.reason)
    }

    pub fn columns(&self) -> Vec<String> {
        self.matches.iter().map(|m| m.column.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Result of ingesting an uploaded file
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub row_count: usize,
    pub column_count: usize,
    pub schema: Vec<ColumnSchema>,
    pub pii_columns: Vec<String>,
    pub pii_details: Vec<PiiMatch>,
    pub sample_rows: Vec<Vec<Value>>,
}
