// JSON ingestion
//
// Accepted shapes:
//   [{"a": 1, "b": 2}, ...]              records
//   {"a": [1, 2], "b": [3, 4]}            column arrays
//   {"a": {"0": 1, "1": 2}, "b": {...}}   column objects keyed by row label
use serde_json::{Map, Value};

use crate::api::middleware::AppError;
use crate::models::{Cell, Column};

pub fn read_json(bytes: &[u8]) -> Result<Vec<Column>, AppError> {
    let document: Value = serde_json::from_slice(bytes)
        .map_err(|e| AppError::Parse(format!("Invalid JSON: {}", e)))?;

    match document {
        Value::Array(records) => from_records(records),
        Value::Object(columns) => from_columns(columns),
        other => Err(AppError::Parse(format!(
            "Expected a JSON array or object at the top level, found {}",
            json_kind(&other)
        ))),
    }
}

fn from_records(records: Vec<Value>) -> Result<Vec<Column>, AppError> {
    let mut columns: Vec<Column> = Vec::new();

    for (row_idx, record) in records.into_iter().enumerate() {
        let fields = match record {
            Value::Object(fields) => fields,
            other => {
                return Err(AppError::Parse(format!(
                    "Record {} is a {}, expected an object",
                    row_idx,
                    json_kind(&other)
                )))
            }
        };

        for (key, value) in fields {
            let idx = match columns.iter().position(|c| c.name == key) {
                Some(idx) => idx,
                None => {
                    // Keys first seen late are null for earlier rows
                    columns.push(Column::new(key, vec![Cell::Null; row_idx]));
                    columns.len() - 1
                }
            };
            columns[idx].cells.push(Cell::from_json(&value));
        }

        for column in columns.iter_mut() {
            if column.cells.len() < row_idx + 1 {
                column.cells.push(Cell::Null);
            }
        }
    }

    Ok(columns)
}

fn from_columns(object: Map<String, Value>) -> Result<Vec<Column>, AppError> {
    let mut columns = Vec::with_capacity(object.len());
    let mut row_labels: Option<Vec<String>> = None;

    for (name, values) in object {
        let cells = match values {
            Value::Array(items) => items.iter().map(Cell::from_json).collect(),
            Value::Object(by_label) => {
                let labels = row_labels.get_or_insert_with(|| by_label.keys().cloned().collect());
                labels
                    .iter()
                    .map(|label| by_label.get(label).map(Cell::from_json).unwrap_or(Cell::Null))
                    .collect()
            }
            other => {
                return Err(AppError::Parse(format!(
                    "Column '{}' is a {}, expected an array or object",
                    name,
                    json_kind(&other)
                )))
            }
        };
        columns.push(Column::new(name, cells));
    }

    Ok(columns)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
