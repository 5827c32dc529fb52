// Embedded analytical store backed by a DataFusion session
use datafusion::arrow::datatypes::Schema;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use datafusion::scalar::ScalarValue;
use datafusion::sql::TableReference;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::adapter::{timeout_error, BackingStore};
use crate::api::middleware::AppError;
use crate::models::TabularBuffer;
use crate::services::datafusion::DataFusionResultConverter;
use crate::services::query_builder::{BuiltQuery, PlaceholderStyle, QuerySource};
use crate::validation::SqlValidator;

/// Column of a table registered in the embedded engine
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegisteredColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
}

/// Metadata about a buffer saved as an embedded table
#[derive(Debug, Clone, Serialize)]
pub struct RegisteredTable {
    pub table_name: String,
    pub columns: Vec<RegisteredColumn>,
    pub row_count: usize,
}

/// Handle on a shared DataFusion session.
///
/// `SessionContext` is reference-counted internally, so every handle for
/// the same descriptor sees the same registered tables.
#[derive(Clone)]
pub struct EmbeddedHandle {
    ctx: SessionContext,
}

impl EmbeddedHandle {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Save a buffer as a named in-memory table.
    ///
    /// Without a name the table is called `table_<YYYYmmdd_HHMMSS>`.
    pub fn register_buffer(&self, name: Option<&str>, buffer: &TabularBuffer) -> Result<RegisteredTable, AppError> {
        let table_name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("table_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")),
        };
        if !SqlValidator::is_identifier(&table_name) {
            return Err(AppError::Validation(format!("Invalid table name: {}", table_name)));
        }
        // Bare references keep the name's case; queries quote it
        let reference = TableReference::bare(table_name.as_str());
        if self.ctx.table_exist(reference.clone())? {
            return Err(AppError::Validation(format!("Table '{}' already exists", table_name)));
        }

        let batch = DataFusionResultConverter::buffer_to_batch(buffer)?;
        let schema = batch.schema();
        let table = MemTable::try_new(schema.clone(), vec![vec![batch]])?;
        self.ctx.register_table(reference, Arc::new(table))?;

        let columns = schema
            .fields()
            .iter()
            .zip(buffer.columns())
            .map(|(field, column)| RegisteredColumn {
                name: field.name().clone(),
                data_type: field.data_type().to_string(),
                nullable: column.has_nulls(),
            })
            .collect();

        tracing::info!(
            "Registered embedded table '{}' with {} rows",
            table_name,
            buffer.row_count()
        );
        Ok(RegisteredTable {
            table_name,
            columns,
            row_count: buffer.row_count(),
        })
    }
}

#[async_trait::async_trait]
impl BackingStore for EmbeddedHandle {
    async fn run_query(&mut self, query: &BuiltQuery, timeout: Duration) -> Result<TabularBuffer, AppError> {
        let rendered = query.render(PlaceholderStyle::Dollar);
        tracing::debug!("Embedded: {}", rendered.sql);

        let params: Vec<ScalarValue> = rendered.params.iter().map(to_scalar).collect();
        let execution = async {
            let mut df = self.ctx.sql(&rendered.sql).await?;
            if !params.is_empty() {
                df = df.with_param_values(params)?;
            }
            let schema: Schema = df.schema().as_arrow().clone();
            let batches = df.collect().await?;
            Ok::<_, datafusion::error::DataFusionError>((schema, batches))
        };

        // Dropping the future stops the plan; the session itself stays usable
        let outcome = tokio::time::timeout(timeout, execution).await;
        match outcome {
            Ok(Ok((schema, batches))) => Ok(DataFusionResultConverter::batches_to_buffer(&schema, &batches)?),
            Ok(Err(e)) => Err(AppError::QueryExecution(format!("Query execution failed: {}", e))),
            Err(_) => Err(timeout_error(timeout)),
        }
    }

    async fn probe_columns(&mut self, source: &QuerySource) -> Result<Vec<String>, AppError> {
        let df = self
            .ctx
            .sql(&source.probe_sql(PlaceholderStyle::Dollar))
            .await
            .map_err(|e| AppError::QueryExecution(format!("Failed to resolve columns: {}", e)))?;
        Ok(df.schema().fields().iter().map(|f| f.name().clone()).collect())
    }

    async fn test_connection(&mut self) -> Result<(), AppError> {
        self.ctx
            .sql("SELECT 1")
            .await
            .map_err(|e| AppError::Connection(format!("Connection test failed: {}", e)))?;
        Ok(())
    }
}

fn to_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Null => ScalarValue::Null,
        Value::Bool(b) => ScalarValue::Boolean(Some(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => ScalarValue::Int64(Some(i)),
            None => ScalarValue::Float64(n.as_f64()),
        },
        Value::String(s) => ScalarValue::Utf8(Some(s.clone())),
        other => ScalarValue::Utf8(Some(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregateFunction, AggregationSpec, Cell, DatasetDefinition, FilterClause, FilterOperator};
    use crate::services::datafusion::DataFusionSessionManager;
    use crate::services::query_builder::{build, QueryBuilder};
    use serde_json::json;

    fn orders() -> TabularBuffer {
        TabularBuffer::from_rows(
            vec!["id".into(), "region".into(), "status".into(), "amount".into()],
            vec![
                vec![Cell::Int(1), Cell::Text("north".into()), Cell::Text("shipped".into()), Cell::Int(10)],
                vec![Cell::Int(2), Cell::Text("south".into()), Cell::Text("pending".into()), Cell::Int(5)],
                vec![Cell::Int(3), Cell::Text("north".into()), Cell::Text("shipped".into()), Cell::Int(7)],
                vec![Cell::Int(4), Cell::Text("east".into()), Cell::Null, Cell::Int(1)],
            ],
        )
        .unwrap()
    }

    fn handle() -> EmbeddedHandle {
        let handle = EmbeddedHandle::new(DataFusionSessionManager::default_config().create_session());
        handle.register_buffer(Some("orders"), &orders()).unwrap();
        handle
    }

    #[test]
    fn test_register_buffer_metadata() {
        let handle = EmbeddedHandle::new(DataFusionSessionManager::default_config().create_session());
        let table = handle.register_buffer(None, &orders()).unwrap();
        assert!(table.table_name.starts_with("table_"));
        assert_eq!(table.row_count, 4);
        assert_eq!(table.columns.len(), 4);
        assert_eq!(table.columns[0].data_type, "Int64");
        assert!(table.columns[2].nullable);
        assert!(!table.columns[0].nullable);

        assert!(matches!(
            handle.register_buffer(Some(&table.table_name), &orders()),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            handle.register_buffer(Some("bad name"), &orders()),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_filtered_preview() {
        let mut handle = handle();
        let query = build(
            &DatasetDefinition::from_table("orders"),
            &[FilterClause::new("status", FilterOperator::Eq, "shipped")],
            None,
        )
        .unwrap();

        let buffer = handle.run_query(&query, Duration::from_secs(10)).await.unwrap();
        assert_eq!(buffer.column_names(), vec!["id", "region", "status", "amount"]);
        let mut ids: Vec<Cell> = buffer.column("id").unwrap().cells.clone();
        ids.sort_by_key(|c| c.to_string());
        assert_eq!(ids, vec![Cell::Int(1), Cell::Int(3)]);
    }

    #[tokio::test]
    async fn test_grouped_aggregation() {
        let mut handle = handle();
        let aggregation = AggregationSpec::new()
            .dimension("region")
            .metric("amount", AggregateFunction::Sum);
        let query = build(&DatasetDefinition::from_table("orders"), &[], Some(&aggregation)).unwrap();

        let buffer = handle.run_query(&query, Duration::from_secs(10)).await.unwrap();
        assert_eq!(buffer.column_names(), vec!["region", "amount_sum"]);
        assert_eq!(buffer.row_count(), 3);
        let north = (0..buffer.row_count())
            .find(|&i| buffer.row(i)[0] == &Cell::Text("north".into()))
            .unwrap();
        assert_eq!(buffer.row(north)[1], &Cell::Int(17));
    }

    #[tokio::test]
    async fn test_in_filter_and_limit() {
        let mut handle = handle();
        let query = QueryBuilder::new()
            .with_limit(1)
            .build(
                &DatasetDefinition::from_table("orders"),
                &[FilterClause::new("region", FilterOperator::In, json!(["north", "east"]))],
                None,
            )
            .unwrap();

        // limit + 1 rows come back so truncation can be detected
        let buffer = handle.run_query(&query, Duration::from_secs(10)).await.unwrap();
        assert_eq!(buffer.row_count(), 2);
    }

    #[tokio::test]
    async fn test_probe_and_subquery() {
        let mut handle = handle();
        let columns = handle
            .probe_columns(&QuerySource::Subquery("SELECT id, amount FROM orders".into()))
            .await
            .unwrap();
        assert_eq!(columns, vec!["id", "amount"]);

        let result = handle
            .probe_columns(&QuerySource::Table("missing".into()))
            .await;
        assert!(matches!(result, Err(AppError::QueryExecution(_))));
        tokio_test::assert_ok!(handle.test_connection().await);
    }

    #[tokio::test]
    async fn test_mixed_case_names() {
        let mut handle = EmbeddedHandle::new(DataFusionSessionManager::default_config().create_session());
        let sales = TabularBuffer::from_rows(
            vec!["Region".into(), "Amount".into()],
            vec![
                vec![Cell::Text("north".into()), Cell::Int(10)],
                vec![Cell::Text("north".into()), Cell::Int(2)],
                vec![Cell::Text("south".into()), Cell::Int(4)],
            ],
        )
        .unwrap();
        handle.register_buffer(Some("Sales"), &sales).unwrap();

        let columns = handle.probe_columns(&QuerySource::Table("Sales".into())).await.unwrap();
        assert_eq!(columns, vec!["Region", "Amount"]);

        let aggregation = AggregationSpec::new()
            .dimension("Region")
            .metric("Amount", AggregateFunction::Sum);
        let query = build(
            &DatasetDefinition::from_table("Sales"),
            &[FilterClause::new("Region", FilterOperator::Eq, "north")],
            Some(&aggregation),
        )
        .unwrap();
        let buffer = handle.run_query(&query, Duration::from_secs(10)).await.unwrap();
        assert_eq!(buffer.column_names(), vec!["Region", "Amount_sum"]);
        assert_eq!(buffer.row(0), vec![&Cell::Text("north".into()), &Cell::Int(12)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_query_times_out() {
        let mut handle = EmbeddedHandle::new(DataFusionSessionManager::default_config().create_session());
        let numbers = TabularBuffer::from_rows(
            vec!["n".into()],
            (0..3000).map(|i| vec![Cell::Int(i)]).collect(),
        )
        .unwrap();
        handle.register_buffer(Some("numbers"), &numbers).unwrap();

        let aggregation = AggregationSpec::new().metric("n", AggregateFunction::Sum);
        let query = build(
            &DatasetDefinition::from_query(
                "SELECT a.n AS n FROM numbers a CROSS JOIN numbers b CROSS JOIN numbers c",
            )
            .with_columns(["n"]),
            &[],
            Some(&aggregation),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let result = handle.run_query(&query, Duration::from_millis(200)).await;
        match result {
            Err(AppError::QueryExecution(message)) => assert!(message.contains("timeout"), "{}", message),
            other => panic!("expected a timeout, got {:?}", other.map(|b| b.row_count())),
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        // the session survives the cancelled plan
        tokio_test::assert_ok!(handle.test_connection().await);
    }
}
