// PostgreSQL handle on a pooled connection
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use std::error::Error;
use std::net::IpAddr;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::adapter::{result_buffer, timeout_error, BackingStore};
use crate::api::middleware::AppError;
use crate::models::{Cell, TabularBuffer};
use crate::services::query_builder::{BuiltQuery, PlaceholderStyle, QuerySource};

pub struct PostgresHandle {
    client: Option<Object>,
}

impl PostgresHandle {
    /// Check a connection out of the pool
    pub async fn connect(pool: &Pool) -> Result<Self, AppError> {
        let client = pool
            .get()
            .await
            .map_err(|e| AppError::Connection(format!("Failed to get connection from pool: {}", e)))?;
        Ok(Self { client: Some(client) })
    }

    fn client(&self) -> Result<&Object, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Connection("Connection was discarded".to_string()))
    }

    /// Close the connection instead of returning it to the pool
    fn discard(&mut self) {
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
            tracing::warn!("Discarded PostgreSQL connection after cancellation");
        }
    }
}

#[async_trait::async_trait]
impl BackingStore for PostgresHandle {
    async fn run_query(&mut self, query: &BuiltQuery, timeout: Duration) -> Result<TabularBuffer, AppError> {
        let rendered = query.render(PlaceholderStyle::Dollar);
        tracing::debug!("PostgreSQL: {}", rendered.sql);

        let client = self.client()?;
        let cancel_token = client.cancel_token();
        let execution = async {
            let mut stmt = client.prepare(&rendered.sql).await?;
            // A fractional value against an integer placeholder compares as float8
            let casts = float_casts(stmt.params(), &rendered.params);
            if casts.iter().any(Option::is_some) {
                let recast = query.render_with_casts(PlaceholderStyle::Dollar, &casts);
                tracing::debug!("PostgreSQL (recast): {}", recast.sql);
                stmt = client.prepare(&recast.sql).await?;
            }
            let params = bind_params(stmt.params(), &rendered.params)?;
            let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            let rows = client.query(&stmt, &refs).await?;
            Ok::<_, PgFailure>((stmt, rows))
        };

        let outcome = tokio::time::timeout(timeout, execution).await;
        let (stmt, rows) = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(failure)) => return Err(failure.into()),
            Err(_) => {
                if let Err(e) = cancel_token.cancel_query(NoTls).await {
                    tracing::warn!("Failed to cancel PostgreSQL query: {}", e);
                }
                self.discard();
                return Err(timeout_error(timeout));
            }
        };

        rows_to_buffer(stmt.columns(), &rows)
    }

    async fn probe_columns(&mut self, source: &QuerySource) -> Result<Vec<String>, AppError> {
        let stmt = self
            .client()?
            .prepare(&source.probe_sql(PlaceholderStyle::Dollar))
            .await
            .map_err(PgFailure::from)?;
        Ok(stmt.columns().iter().map(|c| c.name().to_string()).collect())
    }

    async fn test_connection(&mut self) -> Result<(), AppError> {
        self.client()?
            .simple_query("SELECT 1")
            .await
            .map_err(|e| AppError::Connection(format!("Connection test failed: {}", e)))?;
        Ok(())
    }
}

/// Failure inside a statement round trip
enum PgFailure {
    Driver(tokio_postgres::Error),
    Bind(AppError),
}

impl From<tokio_postgres::Error> for PgFailure {
    fn from(e: tokio_postgres::Error) -> Self {
        PgFailure::Driver(e)
    }
}

impl From<AppError> for PgFailure {
    fn from(e: AppError) -> Self {
        PgFailure::Bind(e)
    }
}

impl From<PgFailure> for AppError {
    fn from(failure: PgFailure) -> Self {
        match failure {
            PgFailure::Bind(e) => e,
            PgFailure::Driver(e) if e.is_closed() => {
                AppError::Connection(format!("PostgreSQL connection closed: {}", e))
            }
            PgFailure::Driver(e) => {
                let error_details = if let Some(db_error) = e.as_db_error() {
                    format!(
                        "Code: {}, Message: {}",
                        db_error.code().code(),
                        db_error.message()
                    )
                } else {
                    format!("{}", e)
                };
                AppError::QueryExecution(format!("Query execution failed: {}", error_details))
            }
        }
    }
}

/// A bound value, encoded for whatever type the server inferred for its
/// placeholder
#[derive(Debug)]
enum PgParam {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            PgParam::Null => Ok(IsNull::Yes),
            PgParam::Bool(v) => v.to_sql(ty, out),
            PgParam::Int2(v) => v.to_sql(ty, out),
            PgParam::Int4(v) => v.to_sql(ty, out),
            PgParam::Int8(v) => v.to_sql(ty, out),
            PgParam::Float4(v) => v.to_sql(ty, out),
            PgParam::Float8(v) => v.to_sql(ty, out),
            PgParam::Numeric(v) => encode_numeric(v, out),
            PgParam::Text(v) => v.to_sql(ty, out),
            PgParam::Date(v) => v.to_sql(ty, out),
            PgParam::Timestamp(v) => v.to_sql(ty, out),
            PgParam::TimestampTz(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_params(types: &[Type], values: &[Value]) -> Result<Vec<PgParam>, AppError> {
    types
        .iter()
        .zip(values)
        .map(|(ty, value)| bind_param(ty, value))
        .collect()
}

fn bind_param(ty: &Type, value: &Value) -> Result<PgParam, AppError> {
    let mismatch = || {
        AppError::Validation(format!(
            "Cannot bind {} as PostgreSQL {}",
            value,
            ty.name()
        ))
    };
    let text = || match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if value.is_null() {
        return Ok(PgParam::Null);
    }

    let param = match *ty {
        Type::BOOL => match value {
            Value::Bool(b) => PgParam::Bool(*b),
            Value::String(s) => PgParam::Bool(s.parse().map_err(|_| mismatch())?),
            _ => return Err(mismatch()),
        },
        Type::INT2 => PgParam::Int2(integer(value).and_then(|v| i16::try_from(v).ok()).ok_or_else(mismatch)?),
        Type::INT4 => PgParam::Int4(integer(value).and_then(|v| i32::try_from(v).ok()).ok_or_else(mismatch)?),
        Type::INT8 => PgParam::Int8(integer(value).ok_or_else(mismatch)?),
        Type::FLOAT4 => PgParam::Float4(float(value).ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => PgParam::Float8(float(value).ok_or_else(mismatch)?),
        Type::NUMERIC => {
            let v = float(value).ok_or_else(mismatch)?;
            if !v.is_finite() {
                return Err(mismatch());
            }
            PgParam::Numeric(match value {
                Value::Number(n) => n.to_string(),
                _ => v.to_string(),
            })
        }
        Type::DATE => PgParam::Date(
            NaiveDate::parse_from_str(&text(), "%Y-%m-%d").map_err(|_| mismatch())?,
        ),
        Type::TIMESTAMP => PgParam::Timestamp(parse_timestamp(&text()).ok_or_else(mismatch)?),
        Type::TIMESTAMPTZ => {
            let raw = text();
            let ts = DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_timestamp(&raw).map(|naive| naive.and_utc()))
                .ok_or_else(mismatch)?;
            PgParam::TimestampTz(ts)
        }
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => PgParam::Text(text()),
        _ => return Err(mismatch()),
    };
    Ok(param)
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `float8` for each value that is fractional but was inferred as an integer
/// placeholder (`int_col > 10.5`), so it is compared rather than rejected
fn float_casts(types: &[Type], values: &[Value]) -> Vec<Option<&'static str>> {
    types
        .iter()
        .zip(values)
        .map(|(ty, value)| {
            let integral = matches!(*ty, Type::INT2 | Type::INT4 | Type::INT8);
            let fractional = integer(value).is_none() && float(value).is_some_and(f64::is_finite);
            (integral && fractional).then_some("float8")
        })
        .collect()
}

fn float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Encode a plain decimal string (`-12.345`) as a binary NUMERIC:
/// ndigits, weight, sign, dscale, then base-10000 digits
fn encode_numeric(decimal: &str, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    let (negative, unsigned) = match decimal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, decimal),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if !int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit()) {
        return Err(format!("not a plain decimal: {}", decimal).into());
    }

    // Left-pad the integer part and right-pad the fraction to whole groups
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
    let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

    let group = |chunk: &[u8]| -> i16 {
        chunk.iter().fold(0i16, |acc, d| acc * 10 + (d - b'0') as i16)
    };
    let mut groups: Vec<i16> = int_digits.as_bytes().chunks(4).map(group).collect();
    let int_groups = groups.len() as i16;
    groups.extend(frac_digits.as_bytes().chunks(4).map(group));

    let mut weight = int_groups - 1;
    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i16;
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        weight = 0;
    }

    out.put_i16(groups.len() as i16);
    out.put_i16(weight);
    out.put_u16(if negative && !groups.is_empty() { NUMERIC_NEG } else { 0 });
    out.put_u16(frac_part.len() as u16);
    for g in groups {
        out.put_i16(g);
    }
    Ok(IsNull::No)
}

/// NUMERIC decoded into a double
struct PgNumeric(f64);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, mut raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        if raw.len() < 8 {
            return Err("invalid NUMERIC header".into());
        }
        let ndigits = raw.get_i16();
        let weight = raw.get_i16();
        let sign = raw.get_u16();
        let _dscale = raw.get_u16();
        if sign == NUMERIC_NAN {
            return Ok(PgNumeric(f64::NAN));
        }
        if ndigits < 0 || raw.len() < ndigits as usize * 2 {
            return Err("truncated NUMERIC digits".into());
        }
        let digits: Vec<i16> = (0..ndigits).map(|_| raw.get_i16()).collect();

        // Rebuild the decimal text so parsing picks the nearest double
        let weight = weight as i32;
        let group_at = |pos: i32| -> i16 {
            usize::try_from(weight - pos)
                .ok()
                .and_then(|idx| digits.get(idx).copied())
                .unwrap_or(0)
        };
        let mut text = String::from(if sign == NUMERIC_NEG { "-" } else { "" });
        if weight < 0 {
            text.push('0');
        } else {
            for pos in (0..=weight).rev() {
                text.push_str(&format!("{:04}", group_at(pos)));
            }
        }
        let lowest = weight - digits.len() as i32 + 1;
        if lowest < 0 {
            text.push('.');
            for pos in (lowest..0).rev() {
                text.push_str(&format!("{:04}", group_at(pos)));
            }
        }
        Ok(PgNumeric(text.parse()?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn rows_to_buffer(columns: &[tokio_postgres::Column], rows: &[Row]) -> Result<TabularBuffer, AppError> {
    let names = columns.iter().map(|c| c.name().to_string()).collect();
    let mut cells: Vec<Vec<Cell>> = columns.iter().map(|_| Vec::with_capacity(rows.len())).collect();

    for row in rows {
        for (idx, column) in columns.iter().enumerate() {
            cells[idx].push(pg_cell(row, idx, column)?);
        }
    }

    result_buffer(names, cells)
}

fn pg_cell(row: &Row, idx: usize, column: &tokio_postgres::Column) -> Result<Cell, AppError> {
    fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, column: &tokio_postgres::Column) -> Result<Option<T>, AppError> {
        row.try_get::<_, Option<T>>(idx).map_err(|e| {
            AppError::QueryExecution(format!(
                "Failed to decode column '{}' ({}): {}",
                column.name(),
                column.type_().name(),
                e
            ))
        })
    }

    let ty = column.type_();
    let cell = match *ty {
        Type::BOOL => get::<bool>(row, idx, column)?.map(Cell::Bool),
        Type::INT2 => get::<i16>(row, idx, column)?.map(|v| Cell::Int(v as i64)),
        Type::INT4 => get::<i32>(row, idx, column)?.map(|v| Cell::Int(v as i64)),
        Type::INT8 => get::<i64>(row, idx, column)?.map(Cell::Int),
        Type::FLOAT4 => get::<f32>(row, idx, column)?.map(|v| Cell::Float(v as f64)),
        Type::FLOAT8 => get::<f64>(row, idx, column)?.map(Cell::Float),
        Type::NUMERIC => get::<PgNumeric>(row, idx, column)?.map(|v| Cell::Float(v.0)),
        Type::DATE => get::<NaiveDate>(row, idx, column)?.map(Cell::Date),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx, column)?.map(Cell::Timestamp),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, idx, column)?.map(|v| Cell::Timestamp(v.naive_utc())),
        Type::UUID => get::<Uuid>(row, idx, column)?.map(|v| Cell::Text(v.to_string())),
        Type::JSON | Type::JSONB => get::<Value>(row, idx, column)?.map(json_cell),
        Type::INET => get::<IpAddr>(row, idx, column)?.map(|v| Cell::Text(v.to_string())),
        Type::BOOL_ARRAY => get::<Vec<Option<bool>>>(row, idx, column)?.map(array_cell),
        Type::INT2_ARRAY => get::<Vec<Option<i16>>>(row, idx, column)?.map(array_cell),
        Type::INT4_ARRAY => get::<Vec<Option<i32>>>(row, idx, column)?.map(array_cell),
        Type::INT8_ARRAY => get::<Vec<Option<i64>>>(row, idx, column)?.map(array_cell),
        Type::FLOAT4_ARRAY => get::<Vec<Option<f32>>>(row, idx, column)?.map(array_cell),
        Type::FLOAT8_ARRAY => get::<Vec<Option<f64>>>(row, idx, column)?.map(array_cell),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<Option<String>>>(row, idx, column)?.map(array_cell),
        Type::UUID_ARRAY => get::<Vec<Option<Uuid>>>(row, idx, column)?
            .map(|items| array_cell(items.into_iter().map(|u| u.map(|u| u.to_string())).collect())),
        // TEXT, VARCHAR, BPCHAR, NAME and text-like extension types
        _ if <String as FromSql>::accepts(ty) => get::<String>(row, idx, column)?.map(Cell::Text),
        _ => {
            return Err(AppError::QueryExecution(format!(
                "Column '{}' has unsupported PostgreSQL type {}; cast it to text in the query",
                column.name(),
                ty.name()
            )))
        }
    };
    Ok(cell.unwrap_or(Cell::Null))
}

/// JSON documents are returned as their serialized text
fn json_cell(value: Value) -> Cell {
    Cell::Text(value.to_string())
}

/// Arrays are returned as JSON array text
fn array_cell<T: Into<Value>>(items: Vec<Option<T>>) -> Cell {
    let values: Vec<Value> = items
        .into_iter()
        .map(|item| item.map(Into::into).unwrap_or(Value::Null))
        .collect();
    Cell::Text(Value::Array(values).to_string())
}
