// src/decode/table.rs
//! Shared row → observation logic for the CSV and XLSX decoders.

use chrono::NaiveDate;

use super::{parse_date, parse_number, year_start, DecodeError, Observation, SourcePayload};
use crate::config::TableLayout;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Cell {
    fn is_empty(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Cell::Empty => None,
            Cell::Text(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Cell::Number(n) => Some(n.to_string()),
            Cell::Date(d) => Some(d.to_string()),
        }
    }

    fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Cell::Date(d) => Some(*d),
            Cell::Text(s) => parse_date(s),
            Cell::Number(n) if n.fract() == 0.0 => year_start(*n as i64),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Cell::Number(n) => Some(*n),
            Cell::Text(s) => parse_number(s),
            _ => None,
        }
    }
}

static EMPTY: Cell = Cell::Empty;

fn column(headers: &[String], name: &str) -> Result<usize, DecodeError> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
        .ok_or_else(|| DecodeError::new(format!("missing column `{name}`")))
}

enum Shape {
    Wide(Vec<(String, usize)>),
    Long { metric: usize, value: usize },
}

pub(super) fn decode_rows<I>(
    layout: &TableLayout,
    headers: &[String],
    rows: I,
) -> Result<SourcePayload, DecodeError>
where
    I: IntoIterator<Item = Vec<Cell>>,
{
    let date_idx = column(headers, &layout.date_column)?;
    let shape = match (&layout.metric_column, &layout.value_column) {
        (Some(m), Some(v)) => Shape::Long {
            metric: column(headers, m)?,
            value: column(headers, v)?,
        },
        _ => Shape::Wide(
            layout
                .value_columns
                .iter()
                .map(|name| Ok((name.clone(), column(headers, name)?)))
                .collect::<Result<_, DecodeError>>()?,
        ),
    };

    let mut out = Vec::new();
    // header is line 1
    for (i, row) in rows.into_iter().enumerate() {
        let line = i + 2;
        if row.iter().all(Cell::is_empty) {
            continue;
        }
        let cell = |idx: usize| row.get(idx).unwrap_or(&EMPTY);

        let date = cell(date_idx)
            .as_date()
            .ok_or_else(|| DecodeError::new(format!("line {line}: unreadable date")))?;

        match &shape {
            Shape::Wide(cols) => {
                for (name, idx) in cols {
                    let c = cell(*idx);
                    if c.is_empty() {
                        continue;
                    }
                    let value = c.as_number().ok_or_else(|| {
                        DecodeError::new(format!("line {line}: `{name}` is not numeric"))
                    })?;
                    out.push(Observation::new(name.clone(), date, value));
                }
            }
            Shape::Long { metric, value } => {
                let Some(name) = cell(*metric).as_text() else {
                    continue;
                };
                let c = cell(*value);
                if c.is_empty() {
                    continue;
                }
                let v = c.as_number().ok_or_else(|| {
                    DecodeError::new(format!("line {line}: value for `{name}` is not numeric"))
                })?;
                out.push(Observation::new(name, date, v));
            }
        }
    }
    Ok(SourcePayload::new(out))
}
