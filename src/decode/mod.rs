// src/decode/mod.rs
//! Typed decoders: raw endpoint bytes → [`SourcePayload`].
//!
//! Each decoder either yields observations or a [`DecodeError`]; nothing
//! untyped leaves this module. The fetcher maps a `DecodeError` to
//! `FetchError::Parse`, which is never retried.

mod csv;
mod json;
mod table;
mod xlsx;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::DecoderSpec;

/// One data point: `metric` on `date` is `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub metric: String,
    pub date: NaiveDate,
    pub value: f64,
}

impl Observation {
    pub fn new(metric: impl Into<String>, date: NaiveDate, value: f64) -> Self {
        Self {
            metric: metric.into(),
            date,
            value,
        }
    }
}

/// Decoded content of one endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePayload {
    pub observations: Vec<Observation>,
}

impl SourcePayload {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Distinct metric names, sorted.
    pub fn metrics(&self) -> Vec<&str> {
        let mut m: Vec<&str> = self.observations.iter().map(|o| o.metric.as_str()).collect();
        m.sort_unstable();
        m.dedup();
        m
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub fn decode(spec: &DecoderSpec, bytes: &[u8]) -> Result<SourcePayload, DecodeError> {
    match spec {
        DecoderSpec::JsonRows {
            date_field,
            fields,
            array_path,
        } => json::decode_rows(bytes, date_field, fields, array_path.as_deref()),
        DecoderSpec::WorldBank => json::decode_world_bank(bytes),
        DecoderSpec::Csv(layout) => csv::decode(bytes, layout),
        DecoderSpec::Xlsx(layout) => xlsx::decode(bytes, layout),
    }
}

/// Accepts `YYYY-MM-DD`, a datetime starting with one, `YYYY-MM`
/// (first of month) and `YYYY` (first of year).
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.len() >= 10 && s.is_char_boundary(10) {
        if let Ok(d) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
            if s.len() == 10 || matches!(s.as_bytes()[10], b'T' | b' ') {
                return Some(d);
            }
        }
    }
    if s.len() == 7 {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
            return Some(d);
        }
    }
    if s.len() == 4 {
        if let Ok(year) = s.parse::<i32>() {
            return NaiveDate::from_ymd_opt(year, 1, 1);
        }
    }
    None
}

/// Numbers as published: tolerates thousands separators and blanks.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub(crate) fn year_start(year: i64) -> Option<NaiveDate> {
    let year = i32::try_from(year).ok()?;
    NaiveDate::from_ymd_opt(year, 1, 1).filter(|d| (1000..=9999).contains(&d.year()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_formats() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(parse_date("2024-03-07"), Some(d));
        assert_eq!(parse_date("2024-03-07T10:00:00Z"), Some(d));
        assert_eq!(parse_date("2024-03-07 10:00"), Some(d));
        assert_eq!(parse_date("2024-03"), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(parse_date("2023"), NaiveDate::from_ymd_opt(2023, 1, 1));
        assert_eq!(parse_date("07/03/2024"), None);
        assert_eq!(parse_date("2024-03-07x"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("1,234.5"), Some(1234.5));
        assert_eq!(parse_number("  12 "), Some(12.0));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn payload_metrics_are_distinct() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let p = SourcePayload::new(vec![
            Observation::new("killed", d, 1.0),
            Observation::new("injured", d, 2.0),
            Observation::new("killed", d.succ_opt().unwrap(), 3.0),
        ]);
        assert_eq!(p.metrics(), vec!["injured", "killed"]);
        assert_eq!(p.len(), 3);
    }
}
