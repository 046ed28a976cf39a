//! JSON inputs: concatenated or line-delimited values, or one top-level array

use super::RawRows;
use serde_json::{Map, Value};
use serde_jsonlines::JsonLinesReader;
use std::io::BufRead;

fn into_object(value: Value) -> Result<Map<String, Value>, String> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, found {}", kind(&other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `json` format: a stream of objects, or a single array of objects
pub(super) fn values(mut reader: Box<dyn BufRead + Send>) -> RawRows {
    let starts_with_array = match first_significant_byte(&mut reader) {
        Ok(byte) => byte == Some(b'['),
        Err(e) => return Box::new(std::iter::once(Err(e.to_string()))),
    };

    if starts_with_array {
        return match serde_json::from_reader::<_, Vec<Value>>(reader) {
            Ok(values) => Box::new(values.into_iter().map(into_object)),
            Err(e) => Box::new(std::iter::once(Err(e.to_string()))),
        };
    }

    let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Value>();
    Box::new(stream.map(|value| value.map_err(|e| e.to_string()).and_then(into_object)))
}

/// `jsonl` format: one object per line
pub(super) fn lines(reader: Box<dyn BufRead + Send>) -> RawRows {
    let rows = JsonLinesReader::new(reader).read_all::<Map<String, Value>>();
    Box::new(rows.map(|row| row.map_err(|e| e.to_string())))
}

/// Peek past leading whitespace without consuming the first value byte
fn first_significant_byte(reader: &mut Box<dyn BufRead + Send>) -> std::io::Result<Option<u8>> {
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        match buf.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(i) => {
                let byte = buf[i];
                reader.consume(i);
                return Ok(Some(byte));
            },
            None => {
                let len = buf.len();
                reader.consume(len);
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(raw: &'static str) -> Box<dyn BufRead + Send> {
        Box::new(Cursor::new(raw.as_bytes()))
    }

    #[test]
    fn test_concatenated_values() {
        let rows: Vec<_> = values(reader("{\"a\":1}\n\n  {\"a\":2}{\"a\":3}")).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_top_level_array() {
        let rows: Vec<_> = values(reader("  [{\"a\":1}, {\"a\":2}]")).collect();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_non_object_rejected() {
        let rows: Vec<_> = values(reader("[1]")).collect();
        assert_eq!(rows[0], Err("expected a JSON object, found number".to_string()));
    }

    #[test]
    fn test_json_lines() {
        let rows: Vec<_> = lines(reader("{\"id\":\"1\"}\n{\"id\":\"2\"}\n")).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].as_ref().unwrap()["id"], Value::from("2"));

        let broken: Vec<_> = lines(reader("{\"id\":\n")).collect();
        assert!(broken[0].is_err());
    }
}
