// DataFusion ResultConverter
//
// Converts between Arrow record batches and the internal TabularBuffer so the
// embedded engine, parquet ingestion and in-memory tables share one cell model.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::*;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;
use std::sync::Arc;

use crate::models::{Cell, Column, StorageType, TabularBuffer};

/// Converts Arrow data to and from `TabularBuffer`
pub struct DataFusionResultConverter;

impl DataFusionResultConverter {
    /// Convert record batches into a buffer with one column per schema field.
    /// Joins can expose the same field name twice; repeats are suffixed.
    pub fn batches_to_buffer(schema: &Schema, batches: &[RecordBatch]) -> Result<TabularBuffer> {
        let columns = Self::batches_to_columns(schema, batches)?;
        TabularBuffer::from_result_columns(columns).map_err(|e| anyhow!(e.to_string()))
    }

    /// Convert record batches into raw columns without validating names
    pub fn batches_to_columns(schema: &Schema, batches: &[RecordBatch]) -> Result<Vec<Column>> {
        let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        let mut columns: Vec<Column> = schema
            .fields()
            .iter()
            .map(|field| Column::new(field.name().clone(), Vec::with_capacity(total_rows)))
            .collect();

        for batch in batches {
            for (col_idx, column) in columns.iter_mut().enumerate() {
                let array = batch.column(col_idx);
                for row_idx in 0..batch.num_rows() {
                    column.cells.push(Self::array_value_to_cell(array, row_idx)?);
                }
            }
        }

        Ok(columns)
    }

    /// Convert a single array value to a cell
    fn array_value_to_cell(array: &ArrayRef, row_idx: usize) -> Result<Cell> {
        if array.is_null(row_idx) {
            return Ok(Cell::Null);
        }

        let cell = match array.data_type() {
            DataType::Boolean => {
                let array = array.as_any().downcast_ref::<BooleanArray>()
                    .ok_or_else(|| anyhow!("Failed to downcast to BooleanArray"))?;
                Cell::Bool(array.value(row_idx))
            }

            DataType::Int8 => Cell::Int(array.as_primitive::<Int8Type>().value(row_idx) as i64),
            DataType::Int16 => Cell::Int(array.as_primitive::<Int16Type>().value(row_idx) as i64),
            DataType::Int32 => Cell::Int(array.as_primitive::<Int32Type>().value(row_idx) as i64),
            DataType::Int64 => Cell::Int(array.as_primitive::<Int64Type>().value(row_idx)),
            DataType::UInt8 => Cell::Int(array.as_primitive::<UInt8Type>().value(row_idx) as i64),
            DataType::UInt16 => Cell::Int(array.as_primitive::<UInt16Type>().value(row_idx) as i64),
            DataType::UInt32 => Cell::Int(array.as_primitive::<UInt32Type>().value(row_idx) as i64),
            DataType::UInt64 => {
                let value = array.as_primitive::<UInt64Type>().value(row_idx);
                i64::try_from(value)
                    .map(Cell::Int)
                    .unwrap_or(Cell::Float(value as f64))
            }

            DataType::Float32 => Cell::Float(array.as_primitive::<Float32Type>().value(row_idx) as f64),
            DataType::Float64 => Cell::Float(array.as_primitive::<Float64Type>().value(row_idx)),

            DataType::Decimal128(_, scale) => {
                let value = array.as_primitive::<Decimal128Type>().value(row_idx);
                Cell::Float(value as f64 / 10_f64.powi(*scale as i32))
            }

            DataType::Utf8 => Cell::Text(array.as_string::<i32>().value(row_idx).to_string()),
            DataType::LargeUtf8 => Cell::Text(array.as_string::<i64>().value(row_idx).to_string()),
            DataType::Utf8View => Cell::Text(array.as_string_view().value(row_idx).to_string()),

            DataType::Date32 => Self::date_cell(array.as_primitive::<Date32Type>().value_as_date(row_idx)),
            DataType::Date64 => Self::date_cell(array.as_primitive::<Date64Type>().value_as_date(row_idx)),

            DataType::Timestamp(TimeUnit::Second, _) => {
                Self::timestamp_cell(array.as_primitive::<TimestampSecondType>().value_as_datetime(row_idx))
            }
            DataType::Timestamp(TimeUnit::Millisecond, _) => {
                Self::timestamp_cell(array.as_primitive::<TimestampMillisecondType>().value_as_datetime(row_idx))
            }
            DataType::Timestamp(TimeUnit::Microsecond, _) => {
                Self::timestamp_cell(array.as_primitive::<TimestampMicrosecondType>().value_as_datetime(row_idx))
            }
            DataType::Timestamp(TimeUnit::Nanosecond, _) => {
                Self::timestamp_cell(array.as_primitive::<TimestampNanosecondType>().value_as_datetime(row_idx))
            }

            // Lists, structs, binary, intervals: display form
            _ => Cell::Text(
                array_value_to_string(array, row_idx)
                    .context("Failed to render Arrow value")?,
            ),
        };

        Ok(cell)
    }

    fn date_cell(value: Option<NaiveDate>) -> Cell {
        value.map(Cell::Date).unwrap_or(Cell::Null)
    }

    fn timestamp_cell(value: Option<NaiveDateTime>) -> Cell {
        value.map(Cell::Timestamp).unwrap_or(Cell::Null)
    }

    /// Convert a buffer into a single record batch, typing each column by
    /// its observed storage type
    pub fn buffer_to_batch(buffer: &TabularBuffer) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(buffer.column_count());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(buffer.column_count());

        for column in buffer.columns() {
            let (data_type, array) = Self::column_to_array(column);
            fields.push(Field::new(&column.name, data_type, true));
            arrays.push(array);
        }

        let schema = Arc::new(Schema::new(fields));
        if arrays.is_empty() {
            return Ok(RecordBatch::new_empty(schema));
        }
        RecordBatch::try_new(schema, arrays).context("Failed to build record batch")
    }

    fn column_to_array(column: &Column) -> (DataType, ArrayRef) {
        match column.storage_type() {
            StorageType::Integer => {
                let values: Int64Array = column
                    .cells
                    .iter()
                    .map(|c| match c {
                        Cell::Int(v) => Some(*v),
                        _ => None,
                    })
                    .collect();
                (DataType::Int64, Arc::new(values))
            }
            StorageType::Float => {
                let values: Float64Array = column.cells.iter().map(|c| c.as_f64()).collect();
                (DataType::Float64, Arc::new(values))
            }
            StorageType::Boolean => {
                let values: BooleanArray = column
                    .cells
                    .iter()
                    .map(|c| match c {
                        Cell::Bool(v) => Some(*v),
                        _ => None,
                    })
                    .collect();
                (DataType::Boolean, Arc::new(values))
            }
            StorageType::Date => {
                let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
                let values: Date32Array = column
                    .cells
                    .iter()
                    .map(|c| match c {
                        Cell::Date(d) => Some((*d - epoch).num_days() as i32),
                        _ => None,
                    })
                    .collect();
                (DataType::Date32, Arc::new(values))
            }
            StorageType::Timestamp => {
                let values: TimestampMicrosecondArray = column
                    .cells
                    .iter()
                    .map(|c| match c {
                        Cell::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                        _ => None,
                    })
                    .collect();
                (DataType::Timestamp(TimeUnit::Microsecond, None), Arc::new(values))
            }
            StorageType::Text | StorageType::Mixed | StorageType::Null => {
                let values: StringArray = column
                    .cells
                    .iter()
                    .map(|c| if c.is_null() { None } else { Some(c.to_string()) })
                    .collect();
                (DataType::Utf8, Arc::new(values))
            }
        }
    }
}
