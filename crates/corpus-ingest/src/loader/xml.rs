//! Row-tagged xml inputs
//!
//! Every element named by `rowTag` becomes one record. Child elements become
//! fields, repeated children become arrays, attributes are stored under
//! `attributePrefix` + name, and the text of an element that also has
//! attributes or children is stored under `valueTag`. Elements listed in
//! `inlineTags` (comma separated, e.g. `i,sup`) are markup inside running
//! text: their text is folded into the parent's text instead of becoming a
//! field.

use super::{LoadSpec, RawRows};
use crate::error::{IngestError, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::BufRead;

pub const DEFAULT_ATTRIBUTE_PREFIX: &str = "_";
pub const DEFAULT_VALUE_TAG: &str = crate::schema::VALUE_KEY;

pub(super) fn rows(reader: Box<dyn BufRead + Send>, spec: &LoadSpec) -> Result<RawRows> {
    let row_tag = spec
        .option("rowTag")
        .ok_or_else(|| IngestError::config("xml input requires input_options.rowTag"))?;

    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    Ok(Box::new(XmlRows {
        reader: xml,
        buf: Vec::new(),
        row_tag: row_tag.to_string(),
        root_tag: spec.option("rootTag").map(str::to_string),
        attribute_prefix: spec
            .option("attributePrefix")
            .unwrap_or(DEFAULT_ATTRIBUTE_PREFIX)
            .to_string(),
        value_tag: spec.option("valueTag").unwrap_or(DEFAULT_VALUE_TAG).to_string(),
        inline_tags: spec
            .option("inlineTags")
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        seen_root: false,
        done: false,
    }))
}

/// An element being assembled
struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

struct XmlRows {
    reader: Reader<Box<dyn BufRead + Send>>,
    buf: Vec<u8>,
    row_tag: String,
    root_tag: Option<String>,
    attribute_prefix: String,
    value_tag: String,
    inline_tags: HashSet<String>,
    seen_root: bool,
    done: bool,
}

impl XmlRows {
    fn check_root(&mut self, name: &str) -> std::result::Result<(), String> {
        if self.seen_root {
            return Ok(());
        }
        self.seen_root = true;
        match &self.root_tag {
            Some(root) if name != root && name != self.row_tag => {
                Err(format!("document root is <{}>, expected <{}>", name, root))
            },
            _ => Ok(()),
        }
    }

    /// Skip to the next row element and assemble it
    fn next_row(&mut self) -> std::result::Result<Option<Map<String, Value>>, String> {
        loop {
            self.buf.clear();
            let (frame, empty) = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) => (open_frame(&start, &self.attribute_prefix)?, false),
                Ok(Event::Empty(start)) => (open_frame(&start, &self.attribute_prefix)?, true),
                Ok(Event::Eof) => return Ok(None),
                Ok(_) => continue,
                Err(e) => return Err(position_error(self.reader.buffer_position(), e)),
            };

            self.check_root(&frame.name)?;
            if frame.name != self.row_tag {
                continue;
            }
            if empty {
                return Ok(Some(frame.fields));
            }
            return self.read_row(frame).map(Some);
        }
    }

    fn read_row(&mut self, row: Frame) -> std::result::Result<Map<String, Value>, String> {
        let mut stack = vec![row];

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) => {
                    stack.push(open_frame(&start, &self.attribute_prefix)?);
                },
                Ok(Event::Empty(start)) => {
                    let frame = open_frame(&start, &self.attribute_prefix)?;
                    if self.inline_tags.contains(&frame.name) {
                        continue;
                    }
                    if let Some(parent) = stack.last_mut() {
                        let name = frame.name.clone();
                        append_child(parent, name, close_frame(frame, &self.value_tag));
                    }
                },
                Ok(Event::Text(text)) => {
                    let text = text.unescape().map_err(|e| e.to_string())?;
                    if let Some(frame) = stack.last_mut() {
                        push_text(frame, &text);
                    }
                },
                Ok(Event::CData(data)) => {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    if let Some(frame) = stack.last_mut() {
                        push_text(frame, &text);
                    }
                },
                Ok(Event::End(_)) => {
                    let Some(frame) = stack.pop() else {
                        return Err(position_error(self.reader.buffer_position(), "unbalanced end tag"));
                    };
                    match stack.last_mut() {
                        Some(parent) if self.inline_tags.contains(&frame.name) => {
                            push_text(parent, &frame.text);
                        },
                        Some(parent) => {
                            let name = frame.name.clone();
                            append_child(parent, name, close_frame(frame, &self.value_tag));
                        },
                        None => {
                            let mut fields = frame.fields;
                            if !frame.text.is_empty() {
                                fields.insert(self.value_tag.clone(), Value::String(frame.text));
                            }
                            return Ok(fields);
                        },
                    }
                },
                Ok(Event::Eof) => {
                    return Err(format!("document ended inside <{}>", self.row_tag));
                },
                Ok(_) => {},
                Err(e) => return Err(position_error(self.reader.buffer_position(), e)),
            }
        }
    }
}

impl Iterator for XmlRows {
    type Item = std::result::Result<Map<String, Value>, String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}

fn position_error(position: u64, error: impl std::fmt::Display) -> String {
    format!("at byte {}: {}", position, error)
}

fn open_frame(start: &BytesStart<'_>, attribute_prefix: &str) -> std::result::Result<Frame, String> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut fields = Map::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        if attr.key.as_ref().starts_with(b"xmlns") {
            continue;
        }
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        fields.insert(format!("{}{}", attribute_prefix, key), Value::String(value.into_owned()));
    }

    Ok(Frame {
        name,
        fields,
        text: String::new(),
    })
}

/// Text-only elements collapse to strings; others keep text under the value tag
fn close_frame(frame: Frame, value_tag: &str) -> Value {
    match (frame.fields.is_empty(), frame.text.is_empty()) {
        (true, true) => Value::Null,
        (true, false) => Value::String(frame.text),
        (false, _) => {
            let mut fields = frame.fields;
            if !frame.text.is_empty() {
                fields.insert(value_tag.to_string(), Value::String(frame.text));
            }
            Value::Object(fields)
        },
    }
}

fn push_text(frame: &mut Frame, text: &str) {
    if text.is_empty() {
        return;
    }
    if !frame.text.is_empty() {
        frame.text.push(' ');
    }
    frame.text.push_str(text);
}

/// Repeated children turn into arrays
fn append_child(parent: &mut Frame, name: String, value: Value) {
    match parent.fields.get_mut(&name) {
        None => {
            parent.fields.insert(name, value);
        },
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::descriptor::InputFormat;
    use crate::schema::Schema;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    const PUBMED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE PubmedArticleSet PUBLIC "-//NLM//DTD PubMedArticle, 1st January 2025//EN" "pubmed_250101.dtd">
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation Status="MEDLINE" Owner="NLM">
      <PMID Version="1">31000001</PMID>
      <Article>
        <ArticleTitle>Salt &amp; pepper</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">First part.</AbstractText>
          <AbstractText Label="RESULTS">Second part.</AbstractText>
        </Abstract>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">31000002</PMID>
      <Article><ArticleTitle>Only a title</ArticleTitle><Abstract/></Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>
"#;

    fn spec(options: &[(&str, &str)]) -> LoadSpec {
        LoadSpec {
            format: InputFormat::Xml,
            schema: Schema::default(),
            options: options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            flatten: false,
        }
    }

    fn parse(raw: &'static str, options: &[(&str, &str)]) -> Vec<std::result::Result<Map<String, Value>, String>> {
        rows(Box::new(Cursor::new(raw.as_bytes())), &spec(options))
            .unwrap()
            .collect()
    }

    #[test]
    fn test_row_tag_records() {
        let rows = parse(PUBMED, &[("rowTag", "PubmedArticle"), ("rootTag", "PubmedArticleSet")]);
        assert_eq!(rows.len(), 2);

        let first = rows[0].as_ref().unwrap();
        assert_eq!(
            first["MedlineCitation"]["PMID"],
            json!({"_Version": "1", "_VALUE": "31000001"})
        );
        assert_eq!(first["MedlineCitation"]["_Status"], json!("MEDLINE"));
        assert_eq!(
            first["MedlineCitation"]["Article"]["ArticleTitle"],
            json!("Salt & pepper")
        );
        assert_eq!(
            first["MedlineCitation"]["Article"]["Abstract"]["AbstractText"],
            json!([
                {"_Label": "BACKGROUND", "_VALUE": "First part."},
                {"_Label": "RESULTS", "_VALUE": "Second part."}
            ])
        );

        let second = rows[1].as_ref().unwrap();
        assert_eq!(second["MedlineCitation"]["Article"]["Abstract"], Value::Null);
    }

    #[test]
    fn test_inline_markup_folds_into_text() {
        let rows = parse(
            "<set><row><title>Role of <i>BRCA1</i> in repair</title></row></set>",
            &[("rowTag", "row"), ("inlineTags", "i, sup")],
        );
        assert_eq!(rows[0].as_ref().unwrap()["title"], json!("Role of BRCA1 in repair"));

        let rows = parse(
            "<set><row><title>Role of <i>BRCA1</i></title></row></set>",
            &[("rowTag", "row")],
        );
        assert_eq!(
            rows[0].as_ref().unwrap()["title"],
            json!({"i": "BRCA1", "_VALUE": "Role of"})
        );
    }

    #[test]
    fn test_wrong_root_and_truncation() {
        let rows = parse(PUBMED, &[("rowTag", "PubmedArticle"), ("rootTag", "Other")]);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_err());

        let truncated = parse("<set><row><a>1</a>", &[("rowTag", "row")]);
        assert_eq!(truncated.len(), 1);
        assert!(truncated[0].is_err());
    }

    #[test]
    fn test_row_tag_required() {
        let result = rows(Box::new(Cursor::new(&b"<a/>"[..])), &spec(&[]));
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }
}
