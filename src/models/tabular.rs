use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;

use crate::api::middleware::AppError;

/// A single typed, nullable value of a tabular column
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Numeric view of the cell, parsing text that looks like a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) => Some(*v),
            Cell::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            Cell::Null => StorageType::Null,
            Cell::Bool(_) => StorageType::Boolean,
            Cell::Int(_) => StorageType::Integer,
            Cell::Float(_) => StorageType::Float,
            Cell::Text(_) => StorageType::Text,
            Cell::Date(_) => StorageType::Date,
            Cell::Timestamp(_) => StorageType::Timestamp,
        }
    }

    /// Convert a JSON scalar into a cell
    pub fn from_json(value: &Value) -> Cell {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
            },
            Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }

    /// JSON representation used in API responses
    pub fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            Cell::Bool(b) => json!(b),
            Cell::Int(i) => json!(i),
            Cell::Float(f) if f.is_finite() => json!(f),
            Cell::Float(_) => Value::Null,
            Cell::Text(s) => json!(s),
            Cell::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            Cell::Timestamp(ts) => json!(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Int(i) => write!(f, "{}", i),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Text(s) => f.write_str(s),
            Cell::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Cell::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// Storage type observed over the non-null cells of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Null,
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Timestamp,
    Mixed,
}

impl StorageType {
    /// Combine two observed types; integer widens to float, anything else mixes
    fn merge(self, other: StorageType) -> StorageType {
        match (self, other) {
            (a, b) if a == b => a,
            (StorageType::Null, b) => b,
            (a, StorageType::Null) => a,
            (StorageType::Integer, StorageType::Float) | (StorageType::Float, StorageType::Integer) => {
                StorageType::Float
            }
            _ => StorageType::Mixed,
        }
    }

    pub fn of_cells<'a>(cells: impl IntoIterator<Item = &'a Cell>) -> StorageType {
        cells
            .into_iter()
            .fold(StorageType::Null, |acc, cell| acc.merge(cell.storage_type()))
    }
}

/// A named column of cells
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub cells: Vec<Cell>,
}

impl Column {
    pub fn new(name: impl Into<String>, cells: Vec<Cell>) -> Self {
        Self {
            name: name.into(),
            cells,
        }
    }

    pub fn storage_type(&self) -> StorageType {
        StorageType::of_cells(&self.cells)
    }

    pub fn non_null(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|c| !c.is_null())
    }

    pub fn has_nulls(&self) -> bool {
        self.cells.iter().any(Cell::is_null)
    }
}

/// Ordered set of equal-length named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularBuffer {
    columns: Vec<Column>,
}

impl TabularBuffer {
    /// Build a buffer, rejecting ragged columns and duplicate names
    pub fn new(columns: Vec<Column>) -> Result<Self, AppError> {
        if let Some(first) = columns.first() {
            let expected = first.cells.len();
            if let Some(bad) = columns.iter().find(|c| c.cells.len() != expected) {
                return Err(AppError::Parse(format!(
                    "Column '{}' has {} values, expected {}",
                    bad.name,
                    bad.cells.len(),
                    expected
                )));
            }
        }
        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].iter().any(|c| c.name == column.name) {
                return Err(AppError::Parse(format!(
                    "Duplicate column name '{}'",
                    column.name
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Build a buffer from a query result's columns.
    ///
    /// Result sets may repeat a name (`SELECT id, id`, two `count` columns);
    /// repeats become `name_1`, `name_2`, ... in order of appearance.
    pub fn from_result_columns(mut columns: Vec<Column>) -> Result<Self, AppError> {
        let mut seen: HashSet<String> = HashSet::with_capacity(columns.len());
        for column in &mut columns {
            let mut candidate = column.name.clone();
            let mut counter = 1;
            while seen.contains(&candidate) {
                candidate = format!("{}_{}", column.name, counter);
                counter += 1;
            }
            seen.insert(candidate.clone());
            column.name = candidate;
        }
        Self::new(columns)
    }

    /// Build a buffer from a header and row-major records
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, AppError> {
        let mut columns: Vec<Column> = names
            .into_iter()
            .map(|name| Column::new(name, Vec::with_capacity(rows.len())))
            .collect();
        for (row_idx, row) in rows.into_iter().enumerate() {
            if row.len() != columns.len() {
                return Err(AppError::Parse(format!(
                    "Row {} has {} values, expected {}",
                    row_idx,
                    row.len(),
                    columns.len()
                )));
            }
            for (column, cell) in columns.iter_mut().zip(row) {
                column.cells.push(cell);
            }
        }
        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(|c| c.cells.len()).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row(&self, idx: usize) -> Vec<&Cell> {
        self.columns.iter().map(|c| &c.cells[idx]).collect()
    }

    /// Keep only the rows at the given indices, in that order
    pub fn select_rows(&self, indices: &[usize]) -> TabularBuffer {
        let columns = self
            .columns
            .iter()
            .map(|c| Column::new(c.name.clone(), indices.iter().map(|&i| c.cells[i].clone()).collect()))
            .collect();
        TabularBuffer { columns }
    }

    /// Keep the first `n` rows
    pub fn truncate(&mut self, n: usize) {
        for column in &mut self.columns {
            column.cells.truncate(n);
        }
    }

    /// Row-major JSON rendering of the first `limit` rows
    pub fn json_rows(&self, limit: usize) -> Vec<Vec<Value>> {
        (0..self.row_count().min(limit))
            .map(|idx| self.columns.iter().map(|c| c.cells[idx].to_json()).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_columns_rejected() {
        let result = TabularBuffer::new(vec![
            Column::new("a", vec![Cell::Int(1), Cell::Int(2)]),
            Column::new("b", vec![Cell::Int(1)]),
        ]);
        assert!(matches!(result, Err(AppError::Parse(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = TabularBuffer::new(vec![
            Column::new("a", vec![Cell::Int(1)]),
            Column::new("a", vec![Cell::Int(2)]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_result_columns_renamed_on_repeat() {
        let buffer = TabularBuffer::from_result_columns(vec![
            Column::new("count", vec![Cell::Int(3)]),
            Column::new("count", vec![Cell::Int(4)]),
            Column::new("count_1", vec![Cell::Int(5)]),
            Column::new("count", vec![Cell::Int(6)]),
        ])
        .unwrap();
        assert_eq!(buffer.column_names(), vec!["count", "count_1", "count_1_1", "count_2"]);
        assert_eq!(buffer.column("count_2").unwrap().cells, vec![Cell::Int(6)]);
    }

    #[test]
    fn test_storage_type_merge() {
        let col = Column::new("n", vec![Cell::Int(1), Cell::Null, Cell::Float(2.5)]);
        assert_eq!(col.storage_type(), StorageType::Float);

        let col = Column::new("m", vec![Cell::Int(1), Cell::Text("x".into())]);
        assert_eq!(col.storage_type(), StorageType::Mixed);

        let col = Column::new("e", vec![Cell::Null, Cell::Null]);
        assert_eq!(col.storage_type(), StorageType::Null);
    }

    #[test]
    fn test_from_rows_and_json() {
        let buffer = TabularBuffer::from_rows(
            vec!["id".into(), "label".into()],
            vec![
                vec![Cell::Int(1), Cell::Text("a".into())],
                vec![Cell::Int(2), Cell::Null],
            ],
        )
        .unwrap();
        assert_eq!(buffer.row_count(), 2);
        assert_eq!(
            buffer.json_rows(10),
            vec![vec![json!(1), json!("a")], vec![json!(2), Value::Null]]
        );
    }

    #[test]
    fn test_date_cell_json() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 5).unwrap();
        assert_eq!(Cell::Date(date).to_json(), json!("2023-01-05"));
        assert_eq!(Cell::Float(f64::NAN).to_json(), Value::Null);
    }
}
