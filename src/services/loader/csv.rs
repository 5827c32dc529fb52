// Delimited text ingestion with delimiter sniffing and a Latin-1 fallback
use encoding_rs::WINDOWS_1252;

use crate::api::middleware::AppError;
use crate::models::{Cell, Column};

/// Bytes scanned when sniffing the delimiter
const SNIFF_WINDOW: usize = 4096;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Tab wins over semicolon, which wins over the default comma
pub fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let window = &bytes[..bytes.len().min(SNIFF_WINDOW)];
    if window.contains(&b'\t') {
        b'\t'
    } else if window.contains(&b';') {
        b';'
    } else {
        b','
    }
}

pub fn read_csv(bytes: &[u8]) -> Result<Vec<Column>, AppError> {
    let delimiter = sniff_delimiter(bytes);
    let content = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);

    match parse_delimited(content, delimiter) {
        Ok(columns) => Ok(columns),
        Err(primary) => {
            tracing::warn!("CSV decode failed ({}), retrying as Latin-1", primary);
            // windows-1252 is the WHATWG mapping for the latin1 label
            let (decoded, _, _) = WINDOWS_1252.decode(content);
            parse_delimited(decoded.as_bytes(), delimiter).map_err(|fallback| {
                AppError::Parse(format!(
                    "Failed to parse CSV: {} (Latin-1 fallback: {})",
                    primary, fallback
                ))
            })
        }
    }
}

fn parse_delimited(content: &[u8], delimiter: u8) -> Result<Vec<Column>, ::csv::Error> {
    let mut reader = ::csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_reader(content);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut raw_columns: Vec<Vec<String>> = vec![Vec::new(); headers.len()];

    for record in reader.records() {
        let record = record?;
        for (column, field) in raw_columns.iter_mut().zip(record.iter()) {
            column.push(field.to_string());
        }
    }

    Ok(headers
        .into_iter()
        .zip(raw_columns)
        .map(|(name, values)| Column::new(name, coerce_column(values)))
        .collect())
}

/// Type a column of raw fields: empty fields are null, then the whole column
/// becomes integer, float or boolean when every value parses as one
fn coerce_column(values: Vec<String>) -> Vec<Cell> {
    let present = || values.iter().filter(|v| !v.is_empty());

    if present().next().is_some() {
        if present().all(|v| v.trim().parse::<i64>().is_ok()) {
            return values
                .iter()
                .map(|v| v.trim().parse::<i64>().map(Cell::Int).unwrap_or(Cell::Null))
                .collect();
        }
        if present().all(|v| v.trim().parse::<f64>().is_ok()) {
            return values
                .iter()
                .map(|v| v.trim().parse::<f64>().map(Cell::Float).unwrap_or(Cell::Null))
                .collect();
        }
        if present().all(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "false"))
        {
            return values
                .iter()
                .map(|v| match v.trim().to_lowercase().as_str() {
                    "true" => Cell::Bool(true),
                    "false" => Cell::Bool(false),
                    _ => Cell::Null,
                })
                .collect();
        }
    }

    values
        .into_iter()
        .map(|v| if v.is_empty() { Cell::Null } else { Cell::Text(v) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TabularBuffer;

    fn read(bytes: &[u8]) -> Result<TabularBuffer, AppError> {
        TabularBuffer::new(read_csv(bytes)?)
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter(b"a\tb;c\n"), b'\t');
        assert_eq!(sniff_delimiter(b"a;b,c\n"), b';');
        assert_eq!(sniff_delimiter(b"a,b\n"), b',');

        // Only the first 4 KiB is scanned
        let mut late_tab = vec![b'a'; SNIFF_WINDOW];
        late_tab.extend_from_slice(b"\t");
        assert_eq!(sniff_delimiter(&late_tab), b',');
    }

    #[test]
    fn test_read_typed_columns() {
        let buffer = read(b"id;price;name;active\n1;2.5;ann;true\n2;;bob;False\n").unwrap();
        assert_eq!(buffer.column_names(), vec!["id", "price", "name", "active"]);
        assert_eq!(buffer.column("id").unwrap().cells, vec![Cell::Int(1), Cell::Int(2)]);
        assert_eq!(buffer.column("price").unwrap().cells, vec![Cell::Float(2.5), Cell::Null]);
        assert_eq!(
            buffer.column("active").unwrap().cells,
            vec![Cell::Bool(true), Cell::Bool(false)]
        );
    }

    #[test]
    fn test_bom_is_stripped() {
        let buffer = read(b"\xEF\xBB\xBFcity\nOslo\n").unwrap();
        assert_eq!(buffer.column_names(), vec!["city"]);
    }

    #[test]
    fn test_latin1_fallback() {
        // "café" encoded as Latin-1
        let buffer = read(b"name\ncaf\xE9\n").unwrap();
        assert_eq!(
            buffer.column("name").unwrap().cells,
            vec![Cell::Text("café".to_string())]
        );
    }

    #[test]
    fn test_ragged_rows_fail() {
        let result = read(b"a,b\n1,2\n3\n");
        assert!(matches!(result, Err(AppError::Parse(_))));
    }

    #[test]
    fn test_header_only() {
        let buffer = read(b"a,b\n").unwrap();
        assert_eq!(buffer.column_count(), 2);
        assert_eq!(buffer.row_count(), 0);
    }
}
