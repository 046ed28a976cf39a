//! Delimited text inputs
//!
//! Options: `header` (default true), `sep` or `delimiter` (one byte, default
//! `,`), `quote`. Without a header, columns are named `_c0`, `_c1`, ...

use super::{LoadSpec, RawRows};
use csv::{ReaderBuilder, StringRecord};
use serde_json::{Map, Value};
use std::io::BufRead;

fn single_byte(spec: &LoadSpec, keys: &[&str], default: u8) -> Result<u8, String> {
    let Some(raw) = keys.iter().find_map(|k| spec.option(k)) else {
        return Ok(default);
    };
    match raw.as_bytes() {
        [byte] => Ok(*byte),
        _ if raw == "\\t" => Ok(b'\t'),
        _ => Err(format!("csv option {:?} must be a single byte, got '{}'", keys, raw)),
    }
}

pub(super) fn rows(reader: Box<dyn BufRead + Send>, spec: &LoadSpec) -> Result<RawRows, String> {
    let has_header = spec
        .option("header")
        .map(|v| !v.eq_ignore_ascii_case("false"))
        .unwrap_or(true);

    let mut csv_reader = ReaderBuilder::new()
        .has_headers(has_header)
        .delimiter(single_byte(spec, &["sep", "delimiter"], b',')?)
        .quote(single_byte(spec, &["quote"], b'"')?)
        .flexible(true)
        .from_reader(reader);

    let headers: Option<Vec<String>> = if has_header {
        let headers = csv_reader.headers().map_err(|e| e.to_string())?;
        Some(headers.iter().map(str::to_string).collect())
    } else {
        None
    };

    let records = csv_reader.into_records().map(move |record| {
        record
            .map_err(|e| e.to_string())
            .map(|record| to_row(headers.as_deref(), &record))
    });
    Ok(Box::new(records))
}

fn to_row(headers: Option<&[String]>, record: &StringRecord) -> Map<String, Value> {
    record
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let name = headers
                .and_then(|h| h.get(i).cloned())
                .unwrap_or_else(|| format!("_c{}", i));
            (name, Value::String(cell.to_string()))
        })
        .collect()
}
