// Query Executor
//
// Runs a built query on a checked-out handle and shapes the rows into a
// QueryResult. Stores return up to `limit + 1` rows; the extra row only
// signals truncation and is never returned.

use std::time::{Duration, Instant};

use crate::api::middleware::AppError;
use crate::models::{QueryResult, TabularBuffer};
use crate::services::database::BackingStore;
use crate::services::query_builder::BuiltQuery;
use crate::services::schema_inferencer::{InferenceOptions, SchemaInferencer};

/// Fixed so the same rows always report the same column types
const RESULT_INFERENCE_SEED: u64 = 0x5eed;

pub struct QueryExecutor {
    inferencer: SchemaInferencer,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self {
            inferencer: SchemaInferencer::new(InferenceOptions::seeded(RESULT_INFERENCE_SEED)),
        }
    }

    pub async fn execute(
        &self,
        store: &mut dyn BackingStore,
        query: &BuiltQuery,
        timeout: Duration,
    ) -> Result<QueryResult, AppError> {
        let start = Instant::now();
        let buffer = store.run_query(query, timeout).await.map_err(|e| {
            tracing::error!("Query execution failed: {}", e);
            e
        })?;

        let result = self.shape(buffer, query.limit(), start.elapsed());
        tracing::info!(
            "Query returned {} rows in {}ms{}",
            result.row_count,
            result.execution_time_ms,
            if result.truncated { " (truncated)" } else { "" }
        );
        Ok(result)
    }

    /// Cut to the limit and attach column types
    pub fn shape(&self, mut buffer: TabularBuffer, limit: u64, elapsed: Duration) -> QueryResult {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let truncated = buffer.row_count() > limit;
        if truncated {
            buffer.truncate(limit);
        }

        let column_types = self
            .inferencer
            .infer(&buffer)
            .into_iter()
            .map(|schema| schema.inferred_semantic_type)
            .collect();

        QueryResult {
            columns: buffer.column_names(),
            column_types,
            rows: buffer.json_rows(limit),
            row_count: buffer.row_count(),
            truncated,
            execution_time_ms: elapsed.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cell, DatasetDefinition, FilterClause, FilterOperator, SemanticType};
    use crate::services::database::FileBackedHandle;
    use crate::services::query_builder::{build, QueryBuilder};
    use serde_json::json;

    fn numbers(n: i64) -> FileBackedHandle {
        let rows = (1..=n).map(|i| vec![Cell::Int(i), Cell::Text(format!("item {}", i))]).collect();
        FileBackedHandle::from_buffer(
            "numbers",
            TabularBuffer::from_rows(vec!["n".into(), "label".into()], rows).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_truncation_flag() {
        let executor = QueryExecutor::new();
        let mut handle = numbers(5);

        let query = QueryBuilder::new()
            .with_limit(3)
            .build(&DatasetDefinition::from_table("numbers"), &[], None)
            .unwrap();
        let result = executor.execute(&mut handle, &query, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.row_count, 3);
        assert_eq!(result.rows.len(), 3);
        assert!(result.truncated);

        let query = QueryBuilder::new()
            .with_limit(5)
            .build(&DatasetDefinition::from_table("numbers"), &[], None)
            .unwrap();
        let result = executor.execute(&mut handle, &query, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.row_count, 5);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_result_shape_and_types() {
        let executor = QueryExecutor::new();
        let mut handle = numbers(4);
        let query = build(
            &DatasetDefinition::from_table("numbers"),
            &[FilterClause::new("n", FilterOperator::Gt, 2)],
            None,
        )
        .unwrap();

        let result = executor.execute(&mut handle, &query, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.columns, vec!["n", "label"]);
        assert_eq!(result.column_types[0], SemanticType::Integer);
        assert_eq!(result.column_values("n").unwrap(), vec![&json!(3), &json!(4)]);
    }

    #[tokio::test]
    async fn test_failures_surface_without_rows() {
        let executor = QueryExecutor::new();
        let mut handle = numbers(2);
        let query = build(&DatasetDefinition::from_table("other"), &[], None).unwrap();
        assert!(executor.execute(&mut handle, &query, Duration::from_secs(5)).await.is_err());
    }
}
