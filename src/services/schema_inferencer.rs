// Schema inference over tabular buffers
//
// Best-effort heuristics only: the suggested semantic type of a column is a
// hint for chart building, never a guarantee. Malformed columns fall through
// to `string` instead of failing.

use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::models::{Cell, Column, ColumnSchema, SemanticType, StorageType, TabularBuffer};

/// Fraction of sampled values that must look like dates
const DATE_MATCH_RATIO: f64 = 0.9;

/// Upper bound on distinct values for a categorical column
const CATEGORICAL_MAX_DISTINCT: f64 = 10.0;

/// Distinct values must stay under this share of non-null values
const CATEGORICAL_DISTINCT_RATIO: f64 = 0.1;

const TRUE_TOKENS: [&str; 5] = ["true", "t", "yes", "y", "1"];
const FALSE_TOKENS: [&str; 5] = ["false", "f", "no", "n", "0"];

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\d{4}-\d{2}-\d{2}$",             // YYYY-MM-DD
        r"^\d{2}/\d{2}/\d{4}$",             // MM/DD/YYYY
        r"^\d{2}-\d{2}-\d{4}$",             // DD-MM-YYYY
        r"^\d{4}/\d{2}/\d{2}$",             // YYYY/MM/DD
        r"^\d{1,2}\s+[A-Za-z]{3}\s+\d{4}$", // 1 Jan 2020
    ]
    .iter()
    .map(|p| Regex::new(p).expect("date pattern is valid"))
    .collect()
});

/// Sampling knobs shared by the inference heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceOptions {
    /// Maximum number of values examined by sampled checks
    pub sample_size: usize,
    /// Fixes the sampling RNG; `None` draws a fresh random seed
    pub seed: Option<u64>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            sample_size: 100,
            seed: None,
        }
    }
}

impl InferenceOptions {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    pub(crate) fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

pub struct SchemaInferencer {
    options: InferenceOptions,
}

impl SchemaInferencer {
    pub fn new(options: InferenceOptions) -> Self {
        Self { options }
    }

    /// Infer one `ColumnSchema` per column, in buffer order
    pub fn infer(&self, buffer: &TabularBuffer) -> Vec<ColumnSchema> {
        let mut rng = self.options.rng();
        buffer
            .columns()
            .iter()
            .map(|column| ColumnSchema {
                name: column.name.clone(),
                observed_storage_type: column.storage_type(),
                inferred_semantic_type: self.infer_column(column, &mut rng),
                nullable: column.has_nulls(),
            })
            .collect()
    }

    fn infer_column(&self, column: &Column, rng: &mut StdRng) -> SemanticType {
        let values: Vec<&Cell> = column.non_null().collect();
        if values.is_empty() {
            return SemanticType::String;
        }

        let storage = column.storage_type();
        if let Some(numeric) = numeric_type(storage, &values) {
            return numeric;
        }
        if storage == StorageType::Timestamp {
            return SemanticType::Timestamp;
        }

        let sample = sample(&values, self.options.sample_size, rng);
        if looks_like_dates(&sample) {
            return SemanticType::Date;
        }
        if looks_like_booleans(&values) {
            return SemanticType::Boolean;
        }

        let distinct: HashSet<String> = values.iter().map(|c| c.to_string()).collect();
        let threshold = CATEGORICAL_MAX_DISTINCT.min(values.len() as f64 * CATEGORICAL_DISTINCT_RATIO);
        if (distinct.len() as f64) < threshold {
            return SemanticType::Categorical;
        }

        SemanticType::String
    }
}

impl Default for SchemaInferencer {
    fn default() -> Self {
        Self::new(InferenceOptions::default())
    }
}

/// Convenience wrapper around `SchemaInferencer::infer`
pub fn infer(buffer: &TabularBuffer, options: InferenceOptions) -> Vec<ColumnSchema> {
    SchemaInferencer::new(options).infer(buffer)
}

/// Integer or float when every value is numeric.
///
/// Text columns count as numeric when every value parses as a number, which
/// mirrors how the CSV loader coerces columns.
fn numeric_type(storage: StorageType, values: &[&Cell]) -> Option<SemanticType> {
    if !matches!(
        storage,
        StorageType::Integer | StorageType::Float | StorageType::Text | StorageType::Mixed
    ) {
        return None;
    }
    let mut integral = true;
    for cell in values {
        let number = cell.as_f64()?;
        integral &= match cell {
            Cell::Int(_) => true,
            Cell::Text(s) => s.trim().parse::<i64>().is_ok() || number.fract() == 0.0,
            _ => number.fract() == 0.0,
        };
    }
    Some(if integral {
        SemanticType::Integer
    } else {
        SemanticType::Float
    })
}

/// Up to `size` values drawn without replacement; the whole population when smaller
pub(crate) fn sample<'a, T>(values: &[&'a T], size: usize, rng: &mut StdRng) -> Vec<&'a T> {
    if values.len() <= size {
        return values.to_vec();
    }
    rand::seq::index::sample(rng, values.len(), size)
        .into_iter()
        .map(|idx| values[idx])
        .collect()
}

fn looks_like_dates(sample: &[&Cell]) -> bool {
    if sample.is_empty() {
        return false;
    }
    let matches = sample
        .iter()
        .filter(|cell| match cell {
            Cell::Text(s) => DATE_PATTERNS.iter().any(|p| p.is_match(s)),
            Cell::Date(_) => true,
            _ => false,
        })
        .count();
    matches as f64 >= DATE_MATCH_RATIO * sample.len() as f64
}

fn looks_like_booleans(values: &[&Cell]) -> bool {
    values.iter().all(|cell| {
        let token = cell.to_string().to_lowercase();
        TRUE_TOKENS.contains(&token.as_str()) || FALSE_TOKENS.contains(&token.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn text_column(name: &str, values: &[&str]) -> Column {
        Column::new(name, values.iter().map(|v| Cell::Text(v.to_string())).collect())
    }

    fn infer_single(column: Column) -> ColumnSchema {
        let buffer = TabularBuffer::new(vec![column]).unwrap();
        infer(&buffer, InferenceOptions::seeded(7)).remove(0)
    }

    #[test]
    fn test_one_schema_per_column() {
        let buffer = TabularBuffer::new(vec![
            text_column("a", &["x", "y"]),
            Column::new("b", vec![Cell::Int(1), Cell::Int(2)]),
            Column::new("c", vec![Cell::Null, Cell::Null]),
        ])
        .unwrap();
        let schema = infer(&buffer, InferenceOptions::default());
        assert_eq!(schema.len(), buffer.column_count());
        assert_eq!(schema[2].inferred_semantic_type, SemanticType::String);
        assert!(schema[2].nullable);
    }

    #[test]
    fn test_numeric_strings_are_integers() {
        let schema = infer_single(text_column("n", &["1", "2", "3"]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Integer);
        assert!(!schema.nullable);
    }

    #[test]
    fn test_integral_floats_are_integers() {
        let schema = infer_single(Column::new(
            "n",
            vec![Cell::Float(1.0), Cell::Null, Cell::Float(3.0)],
        ));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Integer);
        assert!(schema.nullable);

        let schema = infer_single(Column::new("x", vec![Cell::Float(1.5), Cell::Int(2)]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Float);
    }

    #[test]
    fn test_date_strings() {
        let schema = infer_single(text_column("d", &["2023-01-01", "2023-02-01"]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Date);

        let schema = infer_single(text_column("d", &["1 Jan 2020", "12 Feb 2021", "03/04/2022"]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Date);
    }

    #[test]
    fn test_date_threshold() {
        // 9 of 10 match: exactly the 90% threshold
        let mut values = vec!["2023-01-01"; 9];
        values.push("soon");
        let schema = infer_single(text_column("d", &values));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Date);

        let mut values = vec!["2023-01-01"; 8];
        values.extend(["soon", "later"]);
        let schema = infer_single(text_column("d", &values));
        assert_ne!(schema.inferred_semantic_type, SemanticType::Date);
    }

    #[test]
    fn test_timestamp_and_date_storage() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let schema = infer_single(Column::new("ts", vec![Cell::Timestamp(ts)]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Timestamp);

        let schema = infer_single(Column::new("d", vec![Cell::Date(ts.date())]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Date);
    }

    #[test]
    fn test_boolean_tokens() {
        let schema = infer_single(text_column("flag", &["Yes", "no", "TRUE", "f"]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Boolean);

        let schema = infer_single(Column::new("b", vec![Cell::Bool(true), Cell::Bool(false)]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Boolean);
    }

    #[test]
    fn test_categorical_and_string() {
        let values: Vec<&str> = (0..200).map(|i| if i % 2 == 0 { "red" } else { "blue" }).collect();
        let schema = infer_single(text_column("color", &values));
        assert_eq!(schema.inferred_semantic_type, SemanticType::Categorical);

        // Few rows: 10% of 4 is below any distinct count
        let schema = infer_single(text_column("color", &["red", "red", "blue", "red"]));
        assert_eq!(schema.inferred_semantic_type, SemanticType::String);
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() {
        let values: Vec<String> = (0..500)
            .map(|i| {
                if i % 7 == 0 {
                    "n/a".to_string()
                } else {
                    format!("2023-01-{:02}", i % 28 + 1)
                }
            })
            .collect();
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        let buffer = TabularBuffer::new(vec![text_column("d", &refs)]).unwrap();
        let first = infer(&buffer, InferenceOptions::seeded(42));
        let second = infer(&buffer, InferenceOptions::seeded(42));
        assert_eq!(first, second);
    }

    #[test]
    fn test_sample_uses_whole_population_when_small() {
        let cells = [Cell::Int(1), Cell::Int(2), Cell::Int(3)];
        let refs: Vec<&Cell> = cells.iter().collect();
        let mut rng = InferenceOptions::seeded(1).rng();
        assert_eq!(sample(&refs, 100, &mut rng).len(), 3);
        assert_eq!(sample(&refs, 2, &mut rng).len(), 2);
    }
}
