// src/decode/xlsx.rs
use std::io::Cursor;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use chrono::{Duration, NaiveDate};

use super::table::{decode_rows, Cell};
use super::{DecodeError, SourcePayload};
use crate::config::TableLayout;

/// Excel serial dates count days from 1899-12-30.
fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    epoch.checked_add_signed(Duration::days(serial.floor() as i64))
}

fn to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => Cell::Text(s.clone()),
        Data::Float(f) => Cell::Number(*f),
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(Cell::Date)
            .unwrap_or(Cell::Empty),
    }
}

/// Reads the first worksheet; the first row is the header.
pub(super) fn decode(bytes: &[u8], layout: &TableLayout) -> Result<SourcePayload, DecodeError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| DecodeError::new(format!("invalid XLSX: {e}")))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| DecodeError::new("workbook has no worksheet"))?
        .map_err(|e| DecodeError::new(format!("unreadable worksheet: {e}")))?;

    let mut rows = range.rows();
    let headers: Vec<String> = rows
        .next()
        .ok_or_else(|| DecodeError::new("worksheet is empty"))?
        .iter()
        .map(|c| c.to_string())
        .collect();

    decode_rows(
        layout,
        &headers,
        rows.map(|r| r.iter().map(to_cell).collect::<Vec<_>>()),
    )
}
