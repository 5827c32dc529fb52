// Spreadsheet ingestion: the first worksheet, first row as header
use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use chrono::{NaiveDateTime, NaiveTime};
use std::io::Cursor;

use crate::api::middleware::AppError;
use crate::models::{Cell, Column};

pub fn read_excel(bytes: &[u8]) -> Result<Vec<Column>, AppError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| AppError::Parse(format!("Failed to open workbook: {}", e)))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::Parse("Workbook has no worksheets".to_string()))?
        .map_err(|e| AppError::Parse(format!("Failed to read first worksheet: {}", e)))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };

    let mut columns: Vec<Column> = header
        .iter()
        .map(|cell| Column::new(header_name(cell), Vec::new()))
        .collect();

    for row in rows {
        for (idx, column) in columns.iter_mut().enumerate() {
            column.cells.push(row.get(idx).map(to_cell).unwrap_or(Cell::Null));
        }
    }

    Ok(columns)
}

fn header_name(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        other => other.as_string().unwrap_or_else(|| other.to_string()),
    }
}

fn to_cell(cell: &Data) -> Cell {
    match cell {
        Data::Empty | Data::Error(_) => Cell::Null,
        Data::Int(i) => Cell::Int(*i),
        // Spreadsheets store every number as a double
        Data::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Cell::Int(*f as i64),
        Data::Float(f) => Cell::Float(*f),
        Data::Bool(b) => Cell::Bool(*b),
        Data::String(s) if s.is_empty() => Cell::Null,
        Data::String(s) => Cell::Text(s.clone()),
        Data::DateTime(_) | Data::DateTimeIso(_) => match cell.as_datetime() {
            Some(ts) => datetime_cell(ts),
            None => Cell::Text(cell.to_string()),
        },
        Data::DurationIso(s) => Cell::Text(s.clone()),
    }
}

/// Midnight values are calendar dates
fn datetime_cell(ts: NaiveDateTime) -> Cell {
    if ts.time() == NaiveTime::MIN {
        Cell::Date(ts.date())
    } else {
        Cell::Timestamp(ts)
    }
}
