// src/decode/csv.rs
use super::table::{decode_rows, Cell};
use super::{DecodeError, SourcePayload};
use crate::config::TableLayout;

pub(super) fn decode(bytes: &[u8], layout: &TableLayout) -> Result<SourcePayload, DecodeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| DecodeError::new(format!("invalid CSV header: {e}")))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| DecodeError::new(format!("invalid CSV: {e}")))?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Cell::Empty
                    } else {
                        Cell::Text(field.to_string())
                    }
                })
                .collect(),
        );
    }
    decode_rows(layout, &headers, rows)
}
