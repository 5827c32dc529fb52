// MySQL handle on a pooled connection
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Params, Pool, Row, Value as MySqlValue};
use serde_json::Value;
use std::time::Duration;

use super::adapter::{result_buffer, timeout_error, BackingStore};
use crate::api::middleware::AppError;
use crate::models::{Cell, TabularBuffer};
use crate::services::query_builder::{BuiltQuery, PlaceholderStyle, QuerySource};

/// Bound on the side connection that kills a timed-out statement
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MySqlHandle {
    conn: Option<Conn>,
    pool: Pool,
}

impl MySqlHandle {
    /// Check a connection out of the pool
    pub async fn connect(pool: &Pool) -> Result<Self, AppError> {
        let conn = pool
            .get_conn()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to get MySQL connection from pool: {}", e)))?;
        Ok(Self {
            conn: Some(conn),
            pool: pool.clone(),
        })
    }

    fn conn(&mut self) -> Result<&mut Conn, AppError> {
        self.conn
            .as_mut()
            .ok_or_else(|| AppError::Connection("Connection was discarded".to_string()))
    }

    /// Kill the running statement from a side connection, then let go of
    /// the timed-out connection without draining its result set. The pool
    /// resets or closes it in the background.
    async fn cancel(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let id = conn.id();
        let kill = async {
            let mut side = self.pool.get_conn().await?;
            side.query_drop(kill_statement(id)).await
        };
        match tokio::time::timeout(CANCEL_TIMEOUT, kill).await {
            Ok(Ok(())) => tracing::warn!("Killed MySQL query on connection {}", id),
            Ok(Err(e)) => tracing::warn!("Failed to kill MySQL query on connection {}: {}", id, e),
            Err(_) => tracing::warn!("Gave up killing MySQL query on connection {}", id),
        }
        drop(conn);
    }
}

#[async_trait::async_trait]
impl BackingStore for MySqlHandle {
    async fn run_query(&mut self, query: &BuiltQuery, timeout: Duration) -> Result<TabularBuffer, AppError> {
        let rendered = query.render(PlaceholderStyle::Question);
        tracing::debug!("MySQL: {}", rendered.sql);

        let params = if rendered.params.is_empty() {
            Params::Empty
        } else {
            Params::Positional(rendered.params.iter().map(to_mysql_value).collect())
        };

        let conn = self.conn()?;
        let execution = async {
            let mut result = conn.exec_iter(rendered.sql.as_str(), params).await?;
            let columns: Vec<(String, ColumnType)> = result
                .columns_ref()
                .iter()
                .map(|c| (c.name_str().into_owned(), c.column_type()))
                .collect();
            let rows: Vec<Row> = result.collect().await?;
            Ok::<_, mysql_async::Error>((columns, rows))
        };

        let outcome = tokio::time::timeout(timeout, execution).await;
        match outcome {
            Ok(Ok((columns, rows))) => rows_to_buffer(&columns, rows),
            Ok(Err(e)) => Err(map_error(e)),
            Err(_) => {
                self.cancel().await;
                Err(timeout_error(timeout))
            }
        }
    }

    async fn probe_columns(&mut self, source: &QuerySource) -> Result<Vec<String>, AppError> {
        let stmt = self
            .conn()?
            .prep(source.probe_sql(PlaceholderStyle::Question))
            .await
            .map_err(map_error)?;
        Ok(stmt.columns().iter().map(|c| c.name_str().into_owned()).collect())
    }

    async fn test_connection(&mut self) -> Result<(), AppError> {
        self.conn()?
            .ping()
            .await
            .map_err(|e| AppError::Connection(format!("Connection test failed: {}", e)))
    }
}

fn map_error(e: mysql_async::Error) -> AppError {
    match e {
        mysql_async::Error::Io(_) => AppError::Connection(format!("MySQL connection failed: {}", e)),
        other => AppError::QueryExecution(format!("Query execution failed: {}", other)),
    }
}

fn kill_statement(connection_id: u32) -> String {
    format!("KILL QUERY {}", connection_id)
}

fn to_mysql_value(value: &Value) -> MySqlValue {
    match value {
        Value::Null => MySqlValue::NULL,
        Value::Bool(b) => MySqlValue::Int(*b as i64),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => MySqlValue::Int(i),
            (None, Some(u)) => MySqlValue::UInt(u),
            _ => MySqlValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => MySqlValue::Bytes(s.as_bytes().to_vec()),
        other => MySqlValue::Bytes(other.to_string().into_bytes()),
    }
}

fn rows_to_buffer(columns: &[(String, ColumnType)], rows: Vec<Row>) -> Result<TabularBuffer, AppError> {
    let names = columns.iter().map(|(name, _)| name.clone()).collect();
    let mut cells: Vec<Vec<Cell>> = columns.iter().map(|_| Vec::with_capacity(rows.len())).collect();

    for row in rows {
        for (idx, (_, column_type)) in columns.iter().enumerate() {
            let cell = match row.get_opt::<MySqlValue, usize>(idx) {
                Some(Ok(value)) => mysql_value_to_cell(value, *column_type),
                Some(Err(_)) | None => Cell::Null,
            };
            cells[idx].push(cell);
        }
    }

    result_buffer(names, cells)
}

fn mysql_value_to_cell(value: MySqlValue, column_type: ColumnType) -> Cell {
    match value {
        MySqlValue::NULL => Cell::Null,
        MySqlValue::Bytes(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            match column_type {
                ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                    text.parse::<f64>().map(Cell::Float).unwrap_or(Cell::Text(text))
                }
                _ => Cell::Text(text),
            }
        }
        MySqlValue::Int(i) => Cell::Int(i),
        MySqlValue::UInt(u) => i64::try_from(u).map(Cell::Int).unwrap_or(Cell::Float(u as f64)),
        MySqlValue::Float(f) => Cell::Float(f as f64),
        MySqlValue::Double(d) => Cell::Float(d),
        MySqlValue::Date(y, m, d, h, min, s, micros) => {
            let Some(date) = NaiveDate::from_ymd_opt(y as i32, m as u32, d as u32) else {
                // Zero dates ('0000-00-00') have no calendar value
                return Cell::Null;
            };
            if column_type == ColumnType::MYSQL_TYPE_DATE {
                Cell::Date(date)
            } else {
                date.and_hms_micro_opt(h as u32, min as u32, s as u32, micros)
                    .map(Cell::Timestamp)
                    .unwrap_or(Cell::Null)
            }
        }
        MySqlValue::Time(is_neg, d, h, m, s, _) => {
            let sign = if is_neg { "-" } else { "" };
            let total_hours = d * 24 + h as u32;
            Cell::Text(format!("{}{}:{:02}:{:02}", sign, total_hours, m, s))
        }
    }
}
