//! Declared source schemas
//!
//! A schema is an ordered list of typed, optionally nested fields. It is
//! validated once when a run starts and then used to project every loaded
//! record onto the declared shape.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Key holding element text when an xml element also carries attributes
pub const VALUE_KEY: &str = "_VALUE";

/// Type of a declared field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FieldType {
    String,
    #[serde(alias = "long", alias = "int")]
    Integer,
    #[serde(alias = "double")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Array { items: Box<FieldType> },
    Struct { fields: Vec<Field> },
}

impl FieldType {
    pub fn array(items: FieldType) -> Self {
        FieldType::Array {
            items: Box::new(items),
        }
    }

    pub fn structure(fields: Vec<Field>) -> Self {
        FieldType::Struct { fields }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Array { .. } => "array",
            FieldType::Struct { .. } => "struct",
        }
    }
}

/// One named, typed column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten)]
    pub data_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: FieldType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered set of declared fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check the schema is well formed for the given flatten setting.
    pub fn validate(&self, flatten: bool) -> Result<()> {
        if self.fields.is_empty() {
            return Err(IngestError::config("schema declares no fields"));
        }
        validate_fields(&self.fields, "")?;

        if flatten {
            let mut seen = HashSet::new();
            for column in self.flattened_columns() {
                if !seen.insert(column.clone()) {
                    return Err(IngestError::config(format!(
                        "flattening produces duplicate column '{}'",
                        column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Column names after nested structs collapse into `parent.child`
    pub fn flattened_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        collect_columns(&self.fields, "", &mut columns);
        columns
    }

    /// Project a raw record onto the schema.
    ///
    /// Undeclared keys are dropped and missing keys become null. Returns a
    /// description of the first structural mismatch on failure.
    pub fn conform(&self, mut raw: Map<String, Value>) -> std::result::Result<Map<String, Value>, String> {
        let mut out = Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = raw.remove(&field.name).unwrap_or(Value::Null);
            let conformed = conform_value(&field.data_type, field.nullable, value, &field.name)?;
            out.insert(field.name.clone(), conformed);
        }
        Ok(out)
    }
}

fn validate_fields(fields: &[Field], prefix: &str) -> Result<()> {
    let mut names = HashSet::new();
    for field in fields {
        let path = join_path(prefix, &field.name);
        if field.name.trim().is_empty() {
            return Err(IngestError::config(format!("empty field name under '{}'", prefix)));
        }
        if !names.insert(field.name.as_str()) {
            return Err(IngestError::config(format!("duplicate field name '{}'", path)));
        }
        validate_type(&field.data_type, &path)?;
    }
    Ok(())
}

fn validate_type(data_type: &FieldType, path: &str) -> Result<()> {
    match data_type {
        FieldType::Struct { fields } if fields.is_empty() => Err(IngestError::config(format!(
            "struct field '{}' declares no members",
            path
        ))),
        FieldType::Struct { fields } => validate_fields(fields, path),
        FieldType::Array { items } => validate_type(items, path),
        _ => Ok(()),
    }
}

fn collect_columns(fields: &[Field], prefix: &str, out: &mut Vec<String>) {
    for field in fields {
        let path = join_path(prefix, &field.name);
        match &field.data_type {
            FieldType::Struct { fields } => collect_columns(fields, &path, out),
            _ => out.push(path),
        }
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn mismatch(path: &str, expected: &FieldType, found: &Value) -> String {
    let found = match found {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    format!("field '{}' expected {} but found {}", path, expected.name(), found)
}

fn conform_value(
    data_type: &FieldType,
    nullable: bool,
    value: Value,
    path: &str,
) -> std::result::Result<Value, String> {
    // untyped formats deliver "" for empty scalar cells
    let value = match value {
        Value::String(s) if s.is_empty() && !matches!(data_type, FieldType::String) => Value::Null,
        other => other,
    };

    if value.is_null() {
        return if nullable {
            Ok(Value::Null)
        } else {
            Err(format!("field '{}' is null but declared non-nullable", path))
        };
    }

    match (data_type, value) {
        (FieldType::Struct { fields }, Value::Object(map)) => {
            let mut out = Map::with_capacity(fields.len());
            let mut map = map;
            for field in fields {
                let child_path = join_path(path, &field.name);
                let child = map.remove(&field.name).unwrap_or(Value::Null);
                out.insert(
                    field.name.clone(),
                    conform_value(&field.data_type, field.nullable, child, &child_path)?,
                );
            }
            Ok(Value::Object(out))
        },
        (FieldType::Struct { fields }, scalar @ (Value::String(_) | Value::Number(_) | Value::Bool(_)))
            if fields.iter().any(|f| f.name == VALUE_KEY) =>
        {
            let mut map = Map::new();
            map.insert(VALUE_KEY.to_string(), scalar);
            conform_value(data_type, nullable, Value::Object(map), path)
        },
        (FieldType::Array { items }, Value::Array(values)) => values
            .into_iter()
            .enumerate()
            .map(|(i, v)| conform_value(items, true, v, &format!("{}[{}]", path, i)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        // a single repeated xml element arrives unwrapped
        (FieldType::Array { items }, single) => {
            Ok(Value::Array(vec![conform_value(items, true, single, &format!("{}[0]", path))?]))
        },
        (scalar_type, Value::Object(mut map)) if map.contains_key(VALUE_KEY) => {
            let inner = map.remove(VALUE_KEY).unwrap_or(Value::Null);
            conform_value(scalar_type, nullable, inner, path)
        },
        (FieldType::String, Value::String(s)) => Ok(Value::String(s)),
        (FieldType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (FieldType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (FieldType::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Value::from(i)),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err(format!("field '{}' expected integer but found {}", path, n)),
            },
        },
        (FieldType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("field '{}' expected integer but found '{}'", path, s)),
        (FieldType::Float, Value::Number(n)) => Ok(Value::Number(n)),
        (FieldType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("field '{}' expected float but found '{}'", path, s)),
        (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (FieldType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("field '{}' expected boolean but found '{}'", path, s)),
        },
        (expected, found) => Err(mismatch(path, expected, &found)),
    }
}

/// Collapse nested objects into dotted top-level columns; arrays are kept as values.
pub fn flatten_record(record: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(record.len());
    for (key, value) in record {
        flatten_into(&key, value, &mut out);
    }
    out
}

fn flatten_into(prefix: &str, value: Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(&join_path(prefix, &key), child, out);
            }
        },
        other => {
            out.insert(prefix.to_string(), other);
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn article_schema() -> Schema {
        Schema::new(vec![
            Field::string("id").not_null(),
            Field::string("abstract"),
            Field::new("year", FieldType::Integer),
            Field::new(
                "versions",
                FieldType::array(FieldType::structure(vec![
                    Field::string("created"),
                    Field::string("version"),
                ])),
            ),
        ])
    }

    fn as_map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty() {
        assert!(Schema::default().validate(false).is_err());

        let dup = Schema::new(vec![Field::string("id"), Field::string("id")]);
        assert!(matches!(dup.validate(false), Err(IngestError::Configuration(_))));

        let empty_struct = Schema::new(vec![Field::new("meta", FieldType::structure(vec![]))]);
        assert!(empty_struct.validate(false).is_err());
    }

    #[test]
    fn test_validate_flatten_collisions() {
        let schema = Schema::new(vec![
            Field::string("a.b"),
            Field::new("a", FieldType::structure(vec![Field::string("b")])),
        ]);
        assert!(schema.validate(false).is_ok());
        assert!(schema.validate(true).is_err());
        assert_eq!(schema.flattened_columns(), vec!["a.b".to_string(), "a.b".to_string()]);
    }

    #[test]
    fn test_conform_projects_and_coerces() {
        let raw = as_map(json!({
            "id": "0704.0001",
            "abstract": "A study",
            "year": "2007",
            "submitter": "dropped",
            "versions": {"created": "Mon, 2 Apr 2007", "version": "v1"}
        }));

        let record = article_schema().conform(raw).unwrap();
        assert_eq!(record["year"], json!(2007));
        assert!(!record.contains_key("submitter"));
        assert_eq!(record["versions"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_conform_reports_mismatch() {
        let raw = as_map(json!({"id": {"nested": true}}));
        let err = article_schema().conform(raw).unwrap_err();
        assert!(err.contains("'id'"), "{}", err);

        let missing_required = as_map(json!({"abstract": "x"}));
        assert!(article_schema().conform(missing_required).is_err());
    }

    #[test]
    fn test_conform_value_key_for_attributed_elements() {
        let schema = Schema::new(vec![
            Field::string("title"),
            Field::new(
                "pmid",
                FieldType::structure(vec![
                    Field::string(VALUE_KEY),
                    Field::new("_Version", FieldType::Integer),
                ]),
            ),
        ]);

        let raw = as_map(json!({
            "title": {"_VALUE": "Heart failure", "_lang": "en"},
            "pmid": "12345"
        }));
        let record = schema.conform(raw).unwrap();
        assert_eq!(record["title"], json!("Heart failure"));
        assert_eq!(record["pmid"], json!({"_VALUE": "12345", "_Version": null}));
    }

    #[test]
    fn test_flatten_record() {
        let flat = flatten_record(as_map(json!({
            "MedlineCitation": {"PMID": "1", "Article": {"ArticleTitle": "T"}},
            "tags": [{"a": 1}]
        })));

        assert_eq!(flat["MedlineCitation.PMID"], json!("1"));
        assert_eq!(flat["MedlineCitation.Article.ArticleTitle"], json!("T"));
        assert_eq!(flat["tags"], json!([{"a": 1}]));
    }

    #[test]
    fn test_schema_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            schema: Schema,
        }

        let doc: Doc = toml::from_str(
            r#"
            [[schema]]
            name = "id"
            type = "string"
            nullable = false

            [[schema]]
            name = "authors_parsed"
            type = "array"
            items = { type = "array", items = { type = "string" } }
            "#,
        )
        .unwrap();

        assert_eq!(doc.schema.fields().len(), 2);
        assert!(!doc.schema.fields()[0].nullable);
        assert_eq!(
            doc.schema.fields()[1].data_type,
            FieldType::array(FieldType::array(FieldType::String))
        );
    }
}
