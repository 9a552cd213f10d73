//! Opaque pagination cursors.
//!
//! Wire form: `"<value>_<tiebreak>"`. The split happens at the **last** underscore, so the
//! value part may contain underscores (text sort keys) while the tiebreak may not.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use backoffice_core::AppError;

/// Separator between the sort value and the tiebreak id.
pub const SEPARATOR: char = '_';

/// Kind of the primary sort field. Determines how cursor values are parsed and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKind {
    /// RFC 3339 timestamp stored as a string, compared at millisecond precision.
    Timestamp,
    Integer,
    /// Finite floating point (e.g. relevance scores).
    Float,
    Text,
}

/// A primary sort value. Comparisons are only meaningful between values of the same kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SortValue {
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        Self::Timestamp(at.timestamp_millis())
    }

    pub fn kind(&self) -> SortKind {
        match self {
            SortValue::Timestamp(_) => SortKind::Timestamp,
            SortValue::Integer(_) => SortKind::Integer,
            SortValue::Float(_) => SortKind::Float,
            SortValue::Text(_) => SortKind::Text,
        }
    }

    /// Total order within one kind. Values of different kinds order by kind.
    pub fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Timestamp(a), SortValue::Timestamp(b)) => a.cmp(b),
            (SortValue::Integer(a), SortValue::Integer(b)) => a.cmp(b),
            (SortValue::Float(a), SortValue::Float(b)) => a.total_cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (a, b) => kind_rank(a.kind()).cmp(&kind_rank(b.kind())),
        }
    }

    fn encode(&self) -> String {
        match self {
            SortValue::Timestamp(ms) => ms.to_string(),
            SortValue::Integer(n) => n.to_string(),
            // `Display` for f64 prints the shortest representation that parses back exactly.
            SortValue::Float(f) => f.to_string(),
            SortValue::Text(s) => s.clone(),
        }
    }

    fn decode(raw: &str, kind: SortKind) -> Result<Self, CursorError> {
        match kind {
            SortKind::Timestamp => raw
                .parse::<i64>()
                .map(SortValue::Timestamp)
                .map_err(|_| CursorError::BadValue(format!("timestamp '{raw}'"))),
            SortKind::Integer => raw
                .parse::<i64>()
                .map(SortValue::Integer)
                .map_err(|_| CursorError::BadValue(format!("integer '{raw}'"))),
            SortKind::Float => {
                let f = raw
                    .parse::<f64>()
                    .map_err(|_| CursorError::BadValue(format!("float '{raw}'")))?;
                if !f.is_finite() {
                    return Err(CursorError::BadValue(format!("non-finite float '{raw}'")));
                }
                Ok(SortValue::Float(f))
            }
            SortKind::Text => Ok(SortValue::Text(raw.to_string())),
        }
    }
}

fn kind_rank(kind: SortKind) -> u8 {
    match kind {
        SortKind::Timestamp => 0,
        SortKind::Integer => 1,
        SortKind::Float => 2,
        SortKind::Text => 3,
    }
}

/// Cursor decoding/encoding error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor has no '_' separator")]
    MissingSeparator,

    #[error("cursor sort value is not a valid {0}")]
    BadValue(String),

    #[error("tiebreak id must not contain '_': {0}")]
    BadTiebreak(String),
}

impl From<CursorError> for AppError {
    fn from(err: CursorError) -> Self {
        AppError::InvalidCursor(err.to_string())
    }
}

/// Position after which the next page starts: `(primary value, tiebreak id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    value: SortValue,
    tiebreak: String,
}

impl Cursor {
    pub fn new(value: SortValue, tiebreak: impl Into<String>) -> Result<Self, CursorError> {
        let tiebreak = tiebreak.into();
        if tiebreak.contains(SEPARATOR) {
            return Err(CursorError::BadTiebreak(tiebreak));
        }
        if let SortValue::Float(f) = value {
            if !f.is_finite() {
                return Err(CursorError::BadValue(format!("non-finite float '{f}'")));
            }
        }
        Ok(Self { value, tiebreak })
    }

    pub fn value(&self) -> &SortValue {
        &self.value
    }

    pub fn tiebreak(&self) -> &str {
        &self.tiebreak
    }

    pub fn into_parts(self) -> (SortValue, String) {
        (self.value, self.tiebreak)
    }

    pub fn encode(&self) -> String {
        format!("{}{SEPARATOR}{}", self.value.encode(), self.tiebreak)
    }

    /// Parse a cursor whose primary value is of `kind`.
    pub fn decode(raw: &str, kind: SortKind) -> Result<Self, CursorError> {
        let (value, tiebreak) = raw
            .rsplit_once(SEPARATOR)
            .ok_or(CursorError::MissingSeparator)?;
        let value = SortValue::decode(value, kind)?;
        Ok(Self {
            value,
            tiebreak: tiebreak.to_string(),
        })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
