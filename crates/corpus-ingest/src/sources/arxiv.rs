//! arXiv metadata snapshot (Kaggle mirror)

use super::Source;
use crate::descriptor::{ArchiveMethod, InputFormat, SourceDescriptor};
use crate::error::Result;
use crate::normalizer::MappingNormalizer;
use crate::schema::{Field, FieldType, Schema};

pub const NAME: &str = "arxiv";

const URL: &str = "https://www.kaggle.com/api/v1/datasets/download/Cornell-University/arxiv";

pub fn schema() -> Schema {
    Schema::new(vec![
        Field::string("abstract"),
        Field::string("authors"),
        Field::new(
            "authors_parsed",
            FieldType::array(FieldType::array(FieldType::String)),
        ),
        Field::string("categories"),
        Field::string("comments"),
        Field::string("doi"),
        Field::string("id"),
        Field::string("journal-ref"),
        Field::string("license"),
        Field::string("report-no"),
        Field::string("submitter"),
        Field::string("title"),
        Field::string("update_date"),
        Field::new(
            "versions",
            FieldType::array(FieldType::structure(vec![
                Field::string("created"),
                Field::string("version"),
            ])),
        ),
    ])
}

pub fn source() -> Result<Source> {
    let descriptor = SourceDescriptor::builder(NAME, InputFormat::Json)
        .urls([URL])
        .filename("arxiv.zip")
        .archive(ArchiveMethod::Zip)
        .extracted_filename("arxiv-metadata-oai-snapshot.json")
        .schema(schema())
        .build()?;

    let normalizer = MappingNormalizer::new("abstract", "id")
        .with_metadata("doi")
        .with_metadata("title")
        .with_renamed("id", "arxiv_id");

    Ok(Source::new(descriptor, normalizer))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{MetadataValue, StructuredRecord};
    use serde_json::json;

    #[test]
    fn test_normalizes_snapshot_line() {
        let source = source().unwrap();
        let raw = json!({
            "id": "0704.0001",
            "submitter": "Pavel Nadolsky",
            "title": "Calculation of prompt diphoton production cross sections",
            "doi": "10.1103/PhysRevD.76.013009",
            "abstract": "  A fully differential calculation in perturbative QCD.\n",
            "versions": [{"version": "v1", "created": "Mon, 2 Apr 2007 19:18:42 GMT"}],
            "authors_parsed": [["Balázs", "C.", ""]]
        });
        let conformed = schema().conform(raw.as_object().cloned().unwrap()).unwrap();

        let out = source.normalizer.select(vec![StructuredRecord::new(conformed)]);
        assert_eq!(out[0].identifier.as_deref(), Some("0704.0001"));
        assert!(out[0].text.as_deref().unwrap().contains("perturbative QCD"));
        assert_eq!(out[0].metadata["arxiv_id"], MetadataValue::from("0704.0001"));
        assert_eq!(
            out[0].metadata["doi"],
            MetadataValue::from("10.1103/PhysRevD.76.013009")
        );
    }
}
