//! Source-supplied projection from structured to canonical records
//!
//! Normalizers are pure: no network or filesystem I/O. The pipeline enforces
//! the canonical record invariants afterwards through [`RecordGate`].

use crate::record::{CandidateRecord, CanonicalRecord, DropReason, MetadataValue, StructuredRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Maps a batch of structured records to candidate canonical records
pub trait Normalizer: Send + Sync {
    fn select(&self, batch: Vec<StructuredRecord>) -> Vec<CandidateRecord>;
}

impl<F> Normalizer for F
where
    F: Fn(Vec<StructuredRecord>) -> Vec<CandidateRecord> + Send + Sync,
{
    fn select(&self, batch: Vec<StructuredRecord>) -> Vec<CandidateRecord> {
        self(batch)
    }
}

/// Declarative field mapping, usable from descriptor files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingSpec {
    /// Field (dotted path) providing the record text
    pub text: String,
    /// Field (dotted path) providing the identifier
    pub identifier: String,
    /// Fields copied into metadata
    #[serde(default)]
    pub metadata: Vec<String>,
    /// Metadata key renames, field -> output key
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

/// Normalizer driven by a [`MappingSpec`]
#[derive(Debug, Clone)]
pub struct MappingNormalizer {
    spec: MappingSpec,
}

impl MappingNormalizer {
    pub fn new(text: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            spec: MappingSpec {
                text: text.into(),
                identifier: identifier.into(),
                metadata: Vec::new(),
                rename: BTreeMap::new(),
            },
        }
    }

    pub fn from_spec(spec: MappingSpec) -> Self {
        Self { spec }
    }

    pub fn with_metadata(mut self, field: impl Into<String>) -> Self {
        self.spec.metadata.push(field.into());
        self
    }

    pub fn with_renamed(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        let field = field.into();
        if !self.spec.metadata.contains(&field) {
            self.spec.metadata.push(field.clone());
        }
        self.spec.rename.insert(field, key.into());
        self
    }

    fn map_one(&self, record: &StructuredRecord) -> CandidateRecord {
        let mut candidate = CandidateRecord::new(
            record.get_str(&self.spec.text),
            record.get_str(&self.spec.identifier),
        );
        for field in &self.spec.metadata {
            let key = self.spec.rename.get(field).unwrap_or(field);
            let value = record.get(field).and_then(MetadataValue::from_json);
            candidate = candidate.with_metadata(key.clone(), value);
        }
        candidate
    }
}

impl Normalizer for MappingNormalizer {
    fn select(&self, batch: Vec<StructuredRecord>) -> Vec<CandidateRecord> {
        batch.iter().map(|r| self.map_one(r)).collect()
    }
}

/// Admission control for normalizer output: enforces the canonical invariants
/// and, optionally, identifier uniqueness within one artifact.
///
/// Uniqueness is scoped per artifact so the emitted set does not depend on
/// which artifact finishes first. An identifier repeated across artifacts
/// (a revised record in a later update file) is emitted once per artifact and
/// downstream overwrite keyed by identifier settles it. Open scopes hold at
/// most the identifiers of the artifacts currently in flight.
#[derive(Debug)]
pub struct RecordGate {
    source: String,
    dedupe_identifiers: bool,
    seen: HashMap<String, HashSet<String>>,
    emitted: u64,
    dropped: HashMap<DropReason, u64>,
}

impl RecordGate {
    pub fn new(source: impl Into<String>, dedupe_identifiers: bool) -> Self {
        Self {
            source: source.into(),
            dedupe_identifiers,
            seen: HashMap::new(),
            emitted: 0,
            dropped: HashMap::new(),
        }
    }

    /// Admit a candidate produced from the artifact identified by `scope`
    pub fn admit(&mut self, scope: &str, candidate: CandidateRecord) -> Option<CanonicalRecord> {
        let record = match CanonicalRecord::from_candidate(candidate, &self.source) {
            Ok(record) => record,
            Err(reason) => {
                self.reject(reason, None);
                return None;
            },
        };

        if self.dedupe_identifiers {
            let seen = self.seen.entry(scope.to_string()).or_default();
            if !seen.insert(record.identifier.clone()) {
                self.reject(DropReason::DuplicateIdentifier, Some(&record.identifier));
                return None;
            }
        }

        self.emitted += 1;
        Some(record)
    }

    /// Forget the identifiers of a settled artifact
    pub fn close_scope(&mut self, scope: &str) {
        self.seen.remove(scope);
    }

    /// Artifacts with identifiers still tracked
    pub fn open_scopes(&self) -> usize {
        self.seen.len()
    }

    fn reject(&mut self, reason: DropReason, identifier: Option<&str>) {
        debug!(source = %self.source, identifier = ?identifier, reason = %reason, "Dropping record");
        *self.dropped.entry(reason).or_default() += 1;
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Records dropped for violating the canonical invariants
    pub fn dropped_invalid(&self) -> u64 {
        self.dropped_for(DropReason::EmptyText) + self.dropped_for(DropReason::MissingIdentifier)
    }

    pub fn dropped_for(&self, reason: DropReason) -> u64 {
        self.dropped.get(&reason).copied().unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> StructuredRecord {
        StructuredRecord::new(value.as_object().cloned().unwrap())
    }

    #[test]
    fn test_mapping_normalizer() {
        let normalizer = MappingNormalizer::new("abstract", "id")
            .with_metadata("title")
            .with_renamed("id", "arxiv_id");

        let out = normalizer.select(vec![record(json!({
            "id": "0704.0001",
            "abstract": "Calculation of prompt diphoton production",
            "title": "Diphoton",
            "doi": null
        }))]);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].identifier.as_deref(), Some("0704.0001"));
        assert_eq!(out[0].metadata["arxiv_id"], MetadataValue::from("0704.0001"));
        assert_eq!(out[0].metadata["title"], MetadataValue::from("Diphoton"));
    }

    #[test]
    fn test_closure_normalizer() {
        let normalizer = |batch: Vec<StructuredRecord>| -> Vec<CandidateRecord> {
            batch
                .into_iter()
                .map(|r| CandidateRecord::new(r.get_str("body"), r.get_str("key")))
                .collect()
        };
        let out = normalizer.select(vec![record(json!({"body": "b", "key": "k"}))]);
        assert_eq!(out[0].text.as_deref(), Some("b"));
    }

    #[test]
    fn test_gate_drops_invalid_and_duplicates() {
        let mut gate = RecordGate::new("arxiv", true);
        let a = "http://example/a.jsonl";
        assert!(gate.admit(a, CandidateRecord::new(Some("a".into()), Some("1".into()))).is_some());
        assert!(gate.admit(a, CandidateRecord::new(Some("b".into()), Some("1".into()))).is_none());
        assert!(gate.admit(a, CandidateRecord::new(Some("".into()), Some("2".into()))).is_none());
        assert!(gate.admit(a, CandidateRecord::new(Some("c".into()), None)).is_none());

        assert_eq!(gate.emitted(), 1);
        assert_eq!(gate.dropped_invalid(), 2);
        assert_eq!(gate.dropped_for(DropReason::DuplicateIdentifier), 1);
    }

    #[test]
    fn test_gate_scopes_identifiers_per_artifact() {
        let mut gate = RecordGate::new("medline", true);
        let baseline = "http://example/baseline/1.xml.gz";
        let update = "http://example/updatefiles/2.xml.gz";

        assert!(gate.admit(baseline, CandidateRecord::new(Some("old".into()), Some("7".into()))).is_some());
        assert!(gate.admit(update, CandidateRecord::new(Some("new".into()), Some("7".into()))).is_some());
        assert_eq!(gate.open_scopes(), 2);

        gate.close_scope(baseline);
        gate.close_scope(update);
        assert_eq!(gate.open_scopes(), 0);
        assert_eq!(gate.emitted(), 2);
        assert_eq!(gate.dropped_for(DropReason::DuplicateIdentifier), 0);
    }

    #[test]
    fn test_gate_without_dedupe() {
        let mut gate = RecordGate::new("s", false);
        for _ in 0..2 {
            assert!(gate.admit("a", CandidateRecord::new(Some("a".into()), Some("1".into()))).is_some());
        }
        assert_eq!(gate.emitted(), 2);
        assert_eq!(gate.open_scopes(), 0);
    }
}
