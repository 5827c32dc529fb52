// PII column detection
//
// A keyword and value-pattern filter. It is not a compliance control: callers
// must treat the flags as advisory, expecting both false positives and
// false negatives.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{Column, PiiFlagSet, PiiMatch, PiiReason, TabularBuffer};

const PII_KEYWORDS: [&str; 21] = [
    "name",
    "email",
    "phone",
    "address",
    "zip",
    "postal",
    "ssn",
    "social",
    "birth",
    "dob",
    "credit",
    "card",
    "passport",
    "license",
    "gender",
    "nationality",
    "account",
    "password",
    "username",
    "ip",
    "location",
];

static PHONE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{3}[- .]?\d{3}[- .]?\d{4}").expect("phone pattern is valid"));

static SSN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{3}[- ]?\d{2}[- ]?\d{4}").expect("ssn pattern is valid"));

pub struct PiiDetector {
    sample_size: usize,
}

impl PiiDetector {
    pub fn new(sample_size: usize) -> Self {
        Self { sample_size }
    }

    /// Flag columns whose name or sampled values look like personal data
    pub fn detect(&self, buffer: &TabularBuffer) -> PiiFlagSet {
        let matches = buffer
            .columns()
            .iter()
            .filter_map(|column| {
                self.check_column(column).map(|reason| {
                    tracing::debug!("Column '{}' flagged as PII ({:?})", column.name, reason);
                    PiiMatch {
                        column: column.name.clone(),
                        reason,
                    }
                })
            })
            .collect();
        PiiFlagSet { matches }
    }

    /// First matching check wins
    fn check_column(&self, column: &Column) -> Option<PiiReason> {
        let name = column.name.to_lowercase();
        if PII_KEYWORDS.iter().any(|keyword| name.contains(keyword)) {
            return Some(PiiReason::NameKeyword);
        }

        let sample: Vec<String> = column
            .non_null()
            .take(self.sample_size)
            .map(|cell| cell.to_string())
            .collect();

        if sample.iter().any(|v| is_email_shaped(v)) {
            Some(PiiReason::EmailPattern)
        } else if sample.iter().any(|v| PHONE_PATTERN.is_match(v)) {
            Some(PiiReason::PhonePattern)
        } else if sample.iter().any(|v| SSN_PATTERN.is_match(v)) {
            Some(PiiReason::SsnPattern)
        } else {
            None
        }
    }
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Convenience wrapper around `PiiDetector::detect`
pub fn detect(buffer: &TabularBuffer) -> PiiFlagSet {
    PiiDetector::default().detect(buffer)
}

/// Contains `@` with a `.` somewhere after the last `@`
fn is_email_shaped(value: &str) -> bool {
    value
        .rsplit_once('@')
        .map(|(_, domain)| domain.contains('.'))
        .unwrap_or(false)
}
