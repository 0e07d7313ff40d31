//! Detection record model, input validation and the store contract.
//!
//! Front ends feed raw JSON into [`NewDetection::from_json`] and hand the
//! validated result to a [`DetectionStore`]. [`MemoryDetectionStore`] is the
//! volatile implementation; the durable one lives in
//! `detections-store-sqlite`.

use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::Date;

pub const REQUIRED_FIELDS: [&str; 3] = ["date", "confidence", "status"];

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const DATE_TEXT_LEN: usize = 10;

time::serde::format_description!(detection_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DetectionError {
    #[error("missing required fields {}", render_field_list(.0))]
    MissingFields(Vec<&'static str>),
    #[error("confidence must be a float")]
    InvalidConfidenceType,
    #[error("must be between 0 and 1")]
    ConfidenceOutOfRange,
    #[error("{0} is not a valid status")]
    InvalidStatus(String),
    #[error("not a valid date, must be in format of YYYY-mm-dd")]
    InvalidDateFormat,
    #[error("must be in json format")]
    UnsupportedContentType,
    #[error("request body is not valid json")]
    InvalidJson,
    #[error("detection with id of {0} not found")]
    NotFound(i64),
}

impl DetectionError {
    /// Stable machine-readable code for counters and logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => "missing_fields",
            Self::InvalidConfidenceType => "invalid_confidence_type",
            Self::ConfidenceOutOfRange => "confidence_out_of_range",
            Self::InvalidStatus(_) => "invalid_status",
            Self::InvalidDateFormat => "invalid_date_format",
            Self::UnsupportedContentType => "unsupported_content_type",
            Self::InvalidJson => "invalid_json",
            Self::NotFound(_) => "not_found",
        }
    }

    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingFields(_)
                | Self::InvalidConfidenceType
                | Self::ConfidenceOutOfRange
                | Self::InvalidStatus(_)
                | Self::InvalidDateFormat
        )
    }
}

fn render_field_list(fields: &[&'static str]) -> String {
    let quoted: Vec<String> = fields.iter().map(|field| format!("'{field}'")).collect();
    format!("[{}]", quoted.join(", "))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Candidate,
    Confirmed,
    Rejected,
}

impl DetectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    /// Exact, case-sensitive match against the three status names.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "candidate" => Some(Self::Candidate),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl Display for DetectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated detection that has not been assigned an id yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewDetection {
    #[serde(with = "detection_date")]
    pub date: Date,
    pub confidence: f64,
    pub status: DetectionStatus,
    pub notes: String,
}

impl NewDetection {
    /// Validates a raw request body into a [`NewDetection`].
    ///
    /// Checks run in a fixed order and the first failure wins: required
    /// field presence, confidence type and range, status membership, then
    /// the date format.
    ///
    /// # Errors
    /// Returns the [`DetectionError`] variant for the first failed check.
    pub fn from_json(value: &Value) -> Result<Self, DetectionError> {
        let fields = value.as_object();
        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| !fields.is_some_and(|map| map.contains_key(*field)))
            .collect();
        let Some(fields) = fields.filter(|_| missing.is_empty()) else {
            return Err(DetectionError::MissingFields(missing));
        };

        let confidence =
            coerce_confidence(&fields["confidence"]).ok_or(DetectionError::InvalidConfidenceType)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(DetectionError::ConfidenceOutOfRange);
        }

        let status_raw = &fields["status"];
        let status = status_raw
            .as_str()
            .and_then(DetectionStatus::parse)
            .ok_or_else(|| DetectionError::InvalidStatus(render_value(status_raw)))?;

        let date = fields["date"]
            .as_str()
            .ok_or(DetectionError::InvalidDateFormat)
            .and_then(parse_detection_date)?;

        let notes = match fields.get("notes") {
            None | Some(Value::Null) => String::new(),
            Some(other) => render_value(other),
        };

        Ok(Self { date, confidence, status, notes })
    }
}

fn coerce_confidence(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Parses a strict `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`DetectionError::InvalidDateFormat`] for any other shape, a
/// leading sign, trailing input, or an impossible calendar date.
pub fn parse_detection_date(value: &str) -> Result<Date, DetectionError> {
    let starts_with_digit = value.as_bytes().first().is_some_and(u8::is_ascii_digit);
    if value.len() != DATE_TEXT_LEN || !starts_with_digit {
        return Err(DetectionError::InvalidDateFormat);
    }
    Date::parse(value, DATE_FORMAT).map_err(|_| DetectionError::InvalidDateFormat)
}

/// Formats a date in the canonical `YYYY-MM-DD` form.
///
/// # Errors
/// Returns an error when the date cannot be rendered with a four-digit year.
pub fn format_detection_date(value: Date) -> anyhow::Result<String> {
    value
        .format(DATE_FORMAT)
        .map_err(|err| anyhow!("failed to format detection date: {err}"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionRecord {
    pub id: i64,
    #[serde(with = "detection_date")]
    pub date: Date,
    pub confidence: f64,
    pub status: DetectionStatus,
    pub notes: String,
}

impl DetectionRecord {
    #[must_use]
    pub fn from_new(id: i64, detection: NewDetection) -> Self {
        Self {
            id,
            date: detection.date,
            confidence: detection.confidence,
            status: detection.status,
            notes: detection.notes,
        }
    }
}

/// Append-only collection of detection records.
///
/// Implementations assign strictly increasing ids and return `list` in
/// insertion order.
pub trait DetectionStore: Send + Sync {
    /// Stores a validated detection and returns it with its assigned id.
    ///
    /// # Errors
    /// Returns an error when the backing storage fails.
    fn append(&self, detection: NewDetection) -> anyhow::Result<DetectionRecord>;

    /// # Errors
    /// Returns an error when the backing storage fails.
    fn list(&self) -> anyhow::Result<Vec<DetectionRecord>>;

    /// Looks up a record by id; `Ok(None)` means not found.
    ///
    /// # Errors
    /// Returns an error when the backing storage fails.
    fn get(&self, id: i64) -> anyhow::Result<Option<DetectionRecord>>;
}

/// Process-lifetime store. Id assignment and the push happen under one lock.
#[derive(Debug, Default)]
pub struct MemoryDetectionStore {
    records: Mutex<Vec<DetectionRecord>>,
}

impl MemoryDetectionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Vec<DetectionRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("memory detection store lock poisoned"))
    }
}

impl DetectionStore for MemoryDetectionStore {
    fn append(&self, detection: NewDetection) -> anyhow::Result<DetectionRecord> {
        let mut records = self.lock()?;
        let next_id = records.iter().map(|record| record.id).max().unwrap_or(0) + 1;
        let record = DetectionRecord::from_new(next_id, detection);
        records.push(record.clone());
        Ok(record)
    }

    fn list(&self) -> anyhow::Result<Vec<DetectionRecord>> {
        Ok(self.lock()?.clone())
    }

    fn get(&self, id: i64) -> anyhow::Result<Option<DetectionRecord>> {
        Ok(self.lock()?.iter().find(|record| record.id == id).cloned())
    }
}
