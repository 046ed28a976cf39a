//! Record shapes flowing through the pipeline
//!
//! `StructuredRecord` comes out of the loader, `CandidateRecord` out of a
//! source's normalizer, and `CanonicalRecord` is the only shape downstream
//! consumers ever see.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A schema-conformant record produced by the loader. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredRecord {
    fields: Map<String, Value>,
}

impl StructuredRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Look up `a.b.c`, either as a flattened column or by walking nested objects
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(path) {
            return Some(value);
        }

        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// String value at `path`; numbers and booleans are rendered, null is `None`
    pub fn get_str(&self, path: &str) -> Option<String> {
        match self.get(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for StructuredRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}

/// Scalar metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    /// Scalars map directly; arrays and objects become their JSON text; null is `None`
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(MetadataValue::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(MetadataValue::Integer(i)),
                None => n.as_f64().map(MetadataValue::Float),
            },
            Value::String(s) => Some(MetadataValue::String(s.clone())),
            composite => Some(MetadataValue::String(composite.to_string())),
        }
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

/// What a normalizer produces; the pipeline decides whether it is emitted
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateRecord {
    pub text: Option<String>,
    pub identifier: Option<String>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl CandidateRecord {
    pub fn new(text: Option<String>, identifier: Option<String>) -> Self {
        Self {
            text,
            identifier,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Option<MetadataValue>) -> Self {
        if let Some(value) = value {
            self.metadata.insert(key.into(), value);
        }
        self
    }
}

/// Why a candidate was not emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    EmptyText,
    MissingIdentifier,
    DuplicateIdentifier,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::EmptyText => write!(f, "empty text"),
            DropReason::MissingIdentifier => write!(f, "missing identifier"),
            DropReason::DuplicateIdentifier => write!(f, "duplicate identifier"),
        }
    }
}

/// The uniform output record: non-empty text, non-empty identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub text: String,
    pub identifier: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl CanonicalRecord {
    /// Enforce the output invariants on a normalizer candidate
    pub fn from_candidate(candidate: CandidateRecord, source: &str) -> Result<Self, DropReason> {
        let text = match candidate.text {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Err(DropReason::EmptyText),
        };
        let identifier = match candidate.identifier {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => return Err(DropReason::MissingIdentifier),
        };

        Ok(Self {
            text,
            identifier,
            source: source.to_string(),
            metadata: candidate.metadata,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> StructuredRecord {
        StructuredRecord::new(value.as_object().cloned().unwrap())
    }

    #[test]
    fn test_get_nested_and_flattened() {
        let nested = record(json!({"MedlineCitation": {"PMID": {"_VALUE": "42"}}}));
        assert_eq!(nested.get_str("MedlineCitation.PMID._VALUE"), Some("42".to_string()));

        let flat = record(json!({"MedlineCitation.PMID._VALUE": "42", "n": 7}));
        assert_eq!(flat.get_str("MedlineCitation.PMID._VALUE"), Some("42".to_string()));
        assert_eq!(flat.get_str("n"), Some("7".to_string()));
        assert_eq!(flat.get("missing.path"), None);
    }

    #[test]
    fn test_metadata_from_json() {
        assert_eq!(MetadataValue::from_json(&Value::Null), None);
        assert_eq!(MetadataValue::from_json(&json!(3)), Some(MetadataValue::Integer(3)));
        assert_eq!(
            MetadataValue::from_json(&json!(["a", "b"])),
            Some(MetadataValue::String("[\"a\",\"b\"]".to_string()))
        );
    }

    #[test]
    fn test_canonical_invariants() {
        let ok = CandidateRecord::new(Some("An abstract".into()), Some(" 0704.0001 ".into()))
            .with_metadata("doi", Some("10.1/x".into()))
            .with_metadata("missing", None);
        let canonical = CanonicalRecord::from_candidate(ok, "arxiv").unwrap();
        assert_eq!(canonical.identifier, "0704.0001");
        assert_eq!(canonical.source, "arxiv");
        assert_eq!(canonical.metadata.len(), 1);

        let blank = CandidateRecord::new(Some("   ".into()), Some("1".into()));
        assert_eq!(CanonicalRecord::from_candidate(blank, "s"), Err(DropReason::EmptyText));

        let no_id = CandidateRecord::new(Some("text".into()), None);
        assert_eq!(
            CanonicalRecord::from_candidate(no_id, "s"),
            Err(DropReason::MissingIdentifier)
        );
    }

    #[test]
    fn test_canonical_serialization_shape() {
        let record = CanonicalRecord {
            text: "t".to_string(),
            identifier: "1".to_string(),
            source: "s".to_string(),
            metadata: BTreeMap::from([("year".to_string(), MetadataValue::Integer(2024))]),
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({"text": "t", "identifier": "1", "source": "s", "metadata": {"year": 2024}})
        );
    }
}
