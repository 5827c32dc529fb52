// File-backed store: a loaded file queried in-process
//
// There is no engine behind a file source, so the builder's structured plan
// (source, filters, aggregation, limit) is evaluated directly against the
// buffer with SQL semantics.

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::adapter::BackingStore;
use crate::api::middleware::AppError;
use crate::models::{AggregateFunction, AggregationSpec, Cell, FilterClause, FilterOperator, TabularBuffer};
use crate::services::loader::{normalize_column_names, FileLoader};
use crate::services::query_builder::{BuiltQuery, QuerySource};

#[derive(Clone)]
pub struct FileBackedHandle {
    table: String,
    buffer: Arc<TabularBuffer>,
}

impl FileBackedHandle {
    /// Load a file on the blocking pool. The table is named by `table`, or
    /// by the file's normalized stem.
    pub async fn from_path(path: &Path, format: Option<&str>, table: Option<&str>) -> Result<Self, AppError> {
        if !path.is_file() {
            return Err(AppError::Connection(format!("File not found: {}", path.display())));
        }

        let table = match table.map(str::trim).filter(|t| !t.is_empty()) {
            Some(table) => table.to_string(),
            None => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                normalize_column_names(&[stem]).remove(0)
            }
        };

        let owned: PathBuf = path.to_path_buf();
        let format = format.map(str::to_string);
        let buffer = tokio::task::spawn_blocking(move || FileLoader::load_path(&owned, format.as_deref())).await??;

        tracing::info!(
            "Opened file source {} as table '{}' ({} rows)",
            path.display(),
            table,
            buffer.row_count()
        );
        Ok(Self::from_buffer(table, buffer))
    }

    pub fn from_buffer(table: impl Into<String>, buffer: TabularBuffer) -> Self {
        Self {
            table: table.into(),
            buffer: Arc::new(buffer),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn check_source(&self, source: &QuerySource) -> Result<(), AppError> {
        match source {
            QuerySource::Table(name) if name.eq_ignore_ascii_case(&self.table) => Ok(()),
            QuerySource::Table(name) => Err(AppError::InvalidDatasetDefinition(format!(
                "Unknown table '{}'; this file source exposes '{}'",
                name, self.table
            ))),
            QuerySource::Subquery(_) => Err(AppError::InvalidDatasetDefinition(
                "File sources accept a table name, not query text".to_string(),
            )),
        }
    }

    /// Evaluate the built query against the buffer
    pub fn evaluate(&self, query: &BuiltQuery) -> Result<TabularBuffer, AppError> {
        self.check_source(query.source())?;
        let rows = self.matching_rows(query.filters())?;
        let fetch = usize::try_from(query.limit().saturating_add(1)).unwrap_or(usize::MAX);

        match query.aggregation() {
            Some(spec) => {
                let mut result = self.aggregate(spec, &rows)?;
                result.truncate(fetch);
                Ok(result)
            }
            None => {
                let selected: Vec<usize> = rows.into_iter().take(fetch).collect();
                Ok(self.buffer.select_rows(&selected))
            }
        }
    }

    fn column_cells(&self, name: &str) -> Result<&[Cell], AppError> {
        self.buffer
            .column(name)
            .map(|c| c.cells.as_slice())
            .ok_or_else(|| AppError::InvalidColumnReference(format!("Unknown column: {}", name)))
    }

    fn matching_rows(&self, filters: &[FilterClause]) -> Result<Vec<usize>, AppError> {
        let mut predicates = Vec::with_capacity(filters.len());
        for filter in filters {
            predicates.push((self.column_cells(&filter.column)?, Predicate::compile(filter)?));
        }

        Ok((0..self.buffer.row_count())
            .filter(|&row| predicates.iter().all(|(cells, predicate)| predicate.matches(&cells[row])))
            .collect())
    }

    fn aggregate(&self, spec: &AggregationSpec, rows: &[usize]) -> Result<TabularBuffer, AppError> {
        let dimensions = spec
            .dimensions
            .iter()
            .map(|d| self.column_cells(d))
            .collect::<Result<Vec<_>, _>>()?;
        let metrics = spec
            .metrics
            .iter()
            .map(|m| Ok((self.column_cells(&m.column)?, m.function, m.column.as_str())))
            .collect::<Result<Vec<_>, AppError>>()?;

        // Groups in order of first occurrence
        let mut groups: Vec<(Vec<Cell>, Vec<usize>)> = Vec::new();
        if dimensions.is_empty() {
            groups.push((Vec::new(), rows.to_vec()));
        } else {
            let mut index: HashMap<Vec<String>, usize> = HashMap::new();
            for &row in rows {
                let key: Vec<String> = dimensions.iter().map(|cells| format!("{:?}", cells[row])).collect();
                let slot = *index.entry(key).or_insert_with(|| {
                    groups.push((dimensions.iter().map(|cells| cells[row].clone()).collect(), Vec::new()));
                    groups.len() - 1
                });
                groups[slot].1.push(row);
            }
        }

        let mut out_rows = Vec::with_capacity(groups.len());
        for (mut key, members) in groups {
            for (cells, function, column) in &metrics {
                let values = members.iter().map(|&row| &cells[row]).filter(|c| !c.is_null());
                key.push(apply(*function, column, values)?);
            }
            out_rows.push(key);
        }

        TabularBuffer::from_rows(spec.output_columns(), out_rows)
            .map_err(|e| AppError::QueryExecution(e.to_string()))
    }
}

#[async_trait::async_trait]
impl BackingStore for FileBackedHandle {
    async fn run_query(&mut self, query: &BuiltQuery, timeout: Duration) -> Result<TabularBuffer, AppError> {
        tracing::debug!("File source '{}': {}", self.table, query.text());
        let handle = self.clone();
        let query = query.clone();
        let task = tokio::task::spawn_blocking(move || handle.evaluate(&query));
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(super::adapter::timeout_error(timeout)),
        }
    }

    async fn probe_columns(&mut self, source: &QuerySource) -> Result<Vec<String>, AppError> {
        self.check_source(source)?;
        Ok(self.buffer.column_names())
    }

    async fn test_connection(&mut self) -> Result<(), AppError> {
        Ok(())
    }
}

enum Predicate {
    Compare(FilterOperator, Value),
    In(Vec<Value>),
    Like(Regex),
}

impl Predicate {
    fn compile(filter: &FilterClause) -> Result<Self, AppError> {
        Ok(match (filter.operator, &filter.value) {
            (FilterOperator::In, Value::Array(items)) => Predicate::In(items.clone()),
            (FilterOperator::In, scalar) => Predicate::In(vec![scalar.clone()]),
            (FilterOperator::Like, pattern) => Predicate::Like(like_regex(&value_text(pattern))?),
            (op, value) => Predicate::Compare(op, value.clone()),
        })
    }

    /// NULL on either side never matches
    fn matches(&self, cell: &Cell) -> bool {
        if cell.is_null() {
            return false;
        }
        match self {
            Predicate::Compare(op, value) => match compare_value(cell, value) {
                Some(ordering) => match op {
                    FilterOperator::Eq => ordering == Ordering::Equal,
                    FilterOperator::Neq => ordering != Ordering::Equal,
                    FilterOperator::Gt => ordering == Ordering::Greater,
                    FilterOperator::Lt => ordering == Ordering::Less,
                    FilterOperator::In | FilterOperator::Like => false,
                },
                None => false,
            },
            Predicate::In(items) => items
                .iter()
                .any(|item| compare_value(cell, item) == Some(Ordering::Equal)),
            Predicate::Like(regex) => regex.is_match(&cell.to_string()),
        }
    }
}

/// Translate a LIKE pattern (`%` any run, `_` any one character)
fn like_regex(pattern: &str) -> Result<Regex, AppError> {
    let mut expr = String::from("(?s)^");
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| AppError::Validation(format!("Invalid LIKE pattern '{}': {}", pattern, e)))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric when both sides read as numbers, textual otherwise
fn compare_value(cell: &Cell, value: &Value) -> Option<Ordering> {
    if value.is_null() {
        return None;
    }
    compare_cells(cell, &Cell::from_json(value))
}

fn compare_cells(left: &Cell, right: &Cell) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(left.to_string().cmp(&right.to_string())),
    }
}

fn apply<'a>(
    function: AggregateFunction,
    column: &str,
    values: impl Iterator<Item = &'a Cell>,
) -> Result<Cell, AppError> {
    let values: Vec<&Cell> = values.collect();
    match function {
        AggregateFunction::Count => Ok(Cell::Int(values.len() as i64)),
        AggregateFunction::Min | AggregateFunction::Max => {
            let wanted = if function == AggregateFunction::Min { Ordering::Less } else { Ordering::Greater };
            let mut best: Option<&Cell> = None;
            for value in values {
                best = match best {
                    Some(current) if compare_cells(value, current) != Some(wanted) => Some(current),
                    _ => Some(value),
                };
            }
            Ok(best.cloned().unwrap_or(Cell::Null))
        }
        AggregateFunction::Sum | AggregateFunction::Avg => {
            if values.is_empty() {
                return Ok(Cell::Null);
            }
            let numbers = values
                .iter()
                .map(|cell| {
                    cell.as_f64().ok_or_else(|| {
                        AppError::QueryExecution(format!(
                            "Cannot {} non-numeric value '{}' in column {}",
                            function.as_str(),
                            cell,
                            column
                        ))
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;

            if function == AggregateFunction::Avg {
                return Ok(Cell::Float(numbers.iter().sum::<f64>() / numbers.len() as f64));
            }

            let integer_sum = values.iter().try_fold(0_i64, |acc, cell| match cell {
                Cell::Int(v) => acc.checked_add(*v),
                _ => None,
            });
            Ok(match integer_sum {
                Some(sum) => Cell::Int(sum),
                None => Cell::Float(numbers.iter().sum()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetDefinition, FilterClause};
    use crate::services::query_builder::{build, QueryBuilder};
    use serde_json::json;
    use std::io::Write;

    fn sales() -> FileBackedHandle {
        let buffer = TabularBuffer::from_rows(
            vec!["region".into(), "product".into(), "amount".into()],
            vec![
                vec![Cell::Text("north".into()), Cell::Text("widget".into()), Cell::Int(10)],
                vec![Cell::Text("south".into()), Cell::Text("gadget".into()), Cell::Int(4)],
                vec![Cell::Text("north".into()), Cell::Text("gizmo".into()), Cell::Null],
                vec![Cell::Null, Cell::Text("widget".into()), Cell::Int(6)],
                vec![Cell::Text("north".into()), Cell::Text("wrench".into()), Cell::Int(3)],
            ],
        )
        .unwrap();
        FileBackedHandle::from_buffer("sales", buffer)
    }

    fn run(handle: &FileBackedHandle, filters: &[FilterClause], aggregation: Option<&AggregationSpec>) -> TabularBuffer {
        let query = build(&DatasetDefinition::from_table("sales"), filters, aggregation).unwrap();
        handle.evaluate(&query).unwrap()
    }

    #[tokio::test]
    async fn test_csv_round_trip_preview() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Q1 Sales.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Region,Amount,Order Date").unwrap();
        writeln!(file, "north,10,2023-01-01").unwrap();
        writeln!(file, "south,,2023-02-01").unwrap();
        drop(file);

        let mut handle = FileBackedHandle::from_path(&path, None, None).await.unwrap();
        assert_eq!(handle.table(), "q1_sales");

        let query = build(&DatasetDefinition::from_table("q1_sales"), &[], None).unwrap();
        let buffer = handle.run_query(&query, Duration::from_secs(5)).await.unwrap();
        assert_eq!(buffer.column_names(), vec!["region", "amount", "order_date"]);
        assert_eq!(
            buffer.json_rows(10),
            vec![
                vec![json!("north"), json!(10), json!("2023-01-01")],
                vec![json!("south"), Value::Null, json!("2023-02-01")],
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_connection_error() {
        let result = FileBackedHandle::from_path(Path::new("/nonexistent/data.csv"), None, None).await;
        assert!(matches!(result, Err(AppError::Connection(_))));
    }

    #[test]
    fn test_null_never_matches() {
        let handle = sales();
        let eq = run(&handle, &[FilterClause::new("region", FilterOperator::Neq, "south")], None);
        // the NULL region row is excluded from != as well
        assert_eq!(eq.row_count(), 3);

        let gt = run(&handle, &[FilterClause::new("amount", FilterOperator::Gt, 3)], None);
        assert_eq!(gt.column("amount").unwrap().cells, vec![Cell::Int(10), Cell::Int(4), Cell::Int(6)]);

        let null_value = run(&handle, &[FilterClause::new("amount", FilterOperator::Eq, Value::Null)], None);
        assert_eq!(null_value.row_count(), 0);
    }

    #[test]
    fn test_like_and_in() {
        let handle = sales();
        let like = run(&handle, &[FilterClause::new("product", FilterOperator::Like, "w%")], None);
        assert_eq!(like.row_count(), 3);

        let single = run(&handle, &[FilterClause::new("product", FilterOperator::Like, "g_dget")], None);
        assert_eq!(single.row_count(), 1);

        let within = run(
            &handle,
            &[FilterClause::new("region", FilterOperator::In, json!(["south", "east"]))],
            None,
        );
        assert_eq!(within.row_count(), 1);

        let empty = run(&handle, &[FilterClause::new("region", FilterOperator::In, json!([]))], None);
        assert_eq!(empty.row_count(), 0);
    }

    #[test]
    fn test_group_by_aggregation() {
        let handle = sales();
        let spec = AggregationSpec::new()
            .dimension("region")
            .metric("amount", AggregateFunction::Sum)
            .metric("amount", AggregateFunction::Count)
            .metric("amount", AggregateFunction::Max);
        let result = run(&handle, &[], Some(&spec));

        assert_eq!(
            result.column_names(),
            vec!["region", "amount_sum", "amount_count", "amount_max"]
        );
        assert_eq!(
            result.json_rows(10),
            vec![
                vec![json!("north"), json!(13), json!(2), json!(10)],
                vec![json!("south"), json!(4), json!(1), json!(4)],
                vec![Value::Null, json!(6), json!(1), json!(6)],
            ]
        );
    }

    #[test]
    fn test_dimensionless_aggregation_yields_one_row() {
        let handle = sales();
        let spec = AggregationSpec::new()
            .metric("amount", AggregateFunction::Avg)
            .metric("amount", AggregateFunction::Min);
        let result = run(&handle, &[], Some(&spec));
        assert_eq!(result.json_rows(10), vec![vec![json!(5.75), json!(3)]]);

        let nothing = run(
            &handle,
            &[FilterClause::new("region", FilterOperator::Eq, "west")],
            Some(&AggregationSpec::new().metric("amount", AggregateFunction::Sum).metric("amount", AggregateFunction::Count)),
        );
        assert_eq!(nothing.json_rows(10), vec![vec![Value::Null, json!(0)]]);
    }

    #[test]
    fn test_fetches_one_extra_row() {
        let handle = sales();
        let query = QueryBuilder::new()
            .with_limit(2)
            .build(&DatasetDefinition::from_table("sales"), &[], None)
            .unwrap();
        assert_eq!(handle.evaluate(&query).unwrap().row_count(), 3);
    }

    #[tokio::test]
    async fn test_evaluation_past_timeout() {
        let rows = (0..200_000)
            .map(|i| vec![Cell::Text(format!("region_{}", i % 97)), Cell::Int(i)])
            .collect();
        let buffer = TabularBuffer::from_rows(vec!["region".into(), "amount".into()], rows).unwrap();
        let mut handle = FileBackedHandle::from_buffer("sales", buffer);

        let spec = AggregationSpec::new()
            .dimension("region")
            .metric("amount", AggregateFunction::Sum);
        let query = build(
            &DatasetDefinition::from_table("sales"),
            &[FilterClause::new("region", FilterOperator::Like, "%_1%")],
            Some(&spec),
        )
        .unwrap();

        match handle.run_query(&query, Duration::ZERO).await {
            Err(AppError::QueryExecution(message)) => assert!(message.contains("timeout"), "{}", message),
            other => panic!("expected a timeout, got {:?}", other.map(|b| b.row_count())),
        }
        // the handle still answers afterwards
        let buffer = handle.run_query(&query, Duration::from_secs(30)).await.unwrap();
        assert!(buffer.row_count() > 0);
    }

    #[test]
    fn test_rejects_query_text_and_other_tables() {
        let handle = sales();
        let subquery = build(&DatasetDefinition::from_query("SELECT * FROM sales"), &[], None).unwrap();
        assert!(matches!(handle.evaluate(&subquery), Err(AppError::InvalidDatasetDefinition(_))));

        let other = build(&DatasetDefinition::from_table("orders"), &[], None).unwrap();
        assert!(matches!(handle.evaluate(&other), Err(AppError::InvalidDatasetDefinition(_))));
    }
}
