// src/decode/json.rs
use serde_json::Value;

use super::{parse_date, parse_number, year_start, DecodeError, Observation, SourcePayload};

fn parse_json(bytes: &[u8]) -> Result<Value, DecodeError> {
    serde_json::from_slice(bytes).map_err(|e| DecodeError::new(format!("invalid JSON: {e}")))
}

fn date_of(v: &Value) -> Option<chrono::NaiveDate> {
    match v {
        Value::String(s) => parse_date(s),
        Value::Number(n) => n.as_i64().and_then(year_start),
        _ => None,
    }
}

fn number_of(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// Array of flat objects, one per date.
pub(super) fn decode_rows(
    bytes: &[u8],
    date_field: &str,
    fields: &[String],
    array_path: Option<&str>,
) -> Result<SourcePayload, DecodeError> {
    let root = parse_json(bytes)?;

    let mut node = &root;
    if let Some(path) = array_path {
        for part in path.split('.').filter(|p| !p.is_empty()) {
            node = node
                .get(part)
                .ok_or_else(|| DecodeError::new(format!("missing `{part}` in `{path}`")))?;
        }
    }
    let rows = node
        .as_array()
        .ok_or_else(|| DecodeError::new("expected a JSON array of rows"))?;

    let mut out = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let obj = row
            .as_object()
            .ok_or_else(|| DecodeError::new(format!("row {i} is not an object")))?;
        let raw_date = obj
            .get(date_field)
            .ok_or_else(|| DecodeError::new(format!("row {i} has no `{date_field}`")))?;
        let date = date_of(raw_date)
            .ok_or_else(|| DecodeError::new(format!("row {i}: unreadable date {raw_date}")))?;

        if fields.is_empty() {
            for (key, v) in obj {
                if key == date_field {
                    continue;
                }
                if let Some(value) = v.as_f64() {
                    out.push(Observation::new(key.clone(), date, value));
                }
            }
        } else {
            for field in fields {
                match obj.get(field) {
                    None | Some(Value::Null) => {}
                    Some(v) => {
                        let value = number_of(v).ok_or_else(|| {
                            DecodeError::new(format!("row {i}: `{field}` is not numeric: {v}"))
                        })?;
                        out.push(Observation::new(field.clone(), date, value));
                    }
                }
            }
        }
    }
    Ok(SourcePayload::new(out))
}

/// World Bank v2: `[meta, [{indicator: {id}, date, value}, ...]]`.
pub(super) fn decode_world_bank(bytes: &[u8]) -> Result<SourcePayload, DecodeError> {
    let root = parse_json(bytes)?;
    let parts = root
        .as_array()
        .ok_or_else(|| DecodeError::new("expected a top-level array"))?;

    if parts.len() < 2 {
        let msg = parts
            .first()
            .and_then(|m| m.get("message"))
            .map(|m| m.to_string())
            .unwrap_or_else(|| "missing data page".to_string());
        return Err(DecodeError::new(format!("World Bank error: {msg}")));
    }

    let items = match &parts[1] {
        Value::Null => return Ok(SourcePayload::default()),
        Value::Array(items) => items,
        _ => return Err(DecodeError::new("data page is not an array")),
    };

    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let metric = item
            .get("indicator")
            .and_then(|ind| ind.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::new(format!("item {i} has no indicator id")))?;
        let date = item
            .get("date")
            .and_then(date_of)
            .ok_or_else(|| DecodeError::new(format!("item {i} has no readable date")))?;
        match item.get("value") {
            None | Some(Value::Null) => {}
            Some(v) => {
                let value = number_of(v)
                    .ok_or_else(|| DecodeError::new(format!("item {i}: value is not numeric")))?;
                out.push(Observation::new(metric, date, value));
            }
        }
    }
    Ok(SourcePayload::new(out))
}
