//! PubMed / MEDLINE baseline and update files
//!
//! Crawled from the NCBI index pages. Each `*.xml.gz` file is read while
//! still compressed; one `PubmedArticle` element is one record.

use super::Source;
use crate::descriptor::{ArchiveMethod, InputFormat, SourceDescriptor};
use crate::error::Result;
use crate::normalizer::Normalizer;
use crate::record::{CandidateRecord, MetadataValue, StructuredRecord};
use crate::schema::{Field, FieldType, Schema, VALUE_KEY};
use serde_json::Value;

pub const NAME: &str = "medline";

const BASELINE: &str = "https://ftp.ncbi.nlm.nih.gov/pubmed/baseline/";
const UPDATE_FILES: &str = "https://ftp.ncbi.nlm.nih.gov/pubmed/updatefiles/";
const MINI_FILE: &str = "https://ftp.ncbi.nlm.nih.gov/pubmed/updatefiles/pubmed25n1275.xml.gz";

const ABSTRACT_TEXT: &str = "MedlineCitation.Article.Abstract.AbstractText";
const PMID: &str = "MedlineCitation.PMID._VALUE";

fn text_with_attributes(attributes: &[&str]) -> FieldType {
    let mut fields = vec![Field::string(VALUE_KEY)];
    fields.extend(attributes.iter().map(|a| Field::string(*a)));
    FieldType::structure(fields)
}

pub fn schema() -> Schema {
    let abstract_text = FieldType::array(text_with_attributes(&["_Label", "_NlmCategory"]));

    Schema::new(vec![
        Field::new(
            "MedlineCitation",
            FieldType::structure(vec![
                Field::string("_Status"),
                Field::string("_Owner"),
                Field::new("PMID", text_with_attributes(&["_Version"])),
                Field::new(
                    "Article",
                    FieldType::structure(vec![
                        Field::new(
                            "Journal",
                            FieldType::structure(vec![
                                Field::string("Title"),
                                Field::string("ISOAbbreviation"),
                            ]),
                        ),
                        Field::string("ArticleTitle"),
                        Field::new(
                            "Abstract",
                            FieldType::structure(vec![
                                Field::new("AbstractText", abstract_text.clone()),
                                Field::string("CopyrightInformation"),
                            ]),
                        ),
                        Field::new("Language", FieldType::array(FieldType::String)),
                    ]),
                ),
                Field::new("NumberOfReferences", FieldType::Integer),
                Field::new(
                    "OtherAbstract",
                    FieldType::array(FieldType::structure(vec![
                        Field::string("_Type"),
                        Field::string("_Language"),
                        Field::new("AbstractText", abstract_text),
                    ])),
                ),
            ]),
        ),
        Field::new(
            "PubmedData",
            FieldType::structure(vec![Field::new(
                "ArticleIdList",
                FieldType::structure(vec![Field::new(
                    "ArticleId",
                    FieldType::array(text_with_attributes(&["_IdType"])),
                )]),
            )]),
        ),
    ])
}

pub fn source() -> Result<Source> {
    let descriptor = SourceDescriptor::builder(NAME, InputFormat::Xml)
        .crawl([BASELINE, UPDATE_FILES], "*.xml.gz")
        .mini_urls([MINI_FILE])
        .archive(ArchiveMethod::GzipStream)
        .input_option("rowTag", "PubmedArticle")
        .input_option("rootTag", "PubmedArticleSet")
        .input_option("inlineTags", "i,b,u,sup,sub")
        .schema(schema())
        .flatten(true)
        .build()?;

    Ok(Source::new(descriptor, MedlineNormalizer))
}

/// Abstract paragraphs joined into the text, PMID as the identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct MedlineNormalizer;

impl Normalizer for MedlineNormalizer {
    fn select(&self, batch: Vec<StructuredRecord>) -> Vec<CandidateRecord> {
        batch.iter().map(normalize).collect()
    }
}

fn normalize(record: &StructuredRecord) -> CandidateRecord {
    let pmid = record.get_str(PMID);
    let field = |path: &str| record.get(path).and_then(MetadataValue::from_json);

    CandidateRecord::new(record.get(ABSTRACT_TEXT).and_then(joined_text), pmid.clone())
        .with_metadata("medline_pmid", pmid.map(MetadataValue::from))
        .with_metadata("medline_journal_title", field("MedlineCitation.Article.Journal.Title"))
        .with_metadata("medline_article_title", field("MedlineCitation.Article.ArticleTitle"))
        .with_metadata("medline_num_refs", field("MedlineCitation.NumberOfReferences"))
        .with_metadata("medline_alt_abstract", field("MedlineCitation.OtherAbstract"))
        .with_metadata("pubmed_article_ids", field("PubmedData.ArticleIdList.ArticleId"))
}

/// Space-joined `_VALUE`s of the abstract paragraphs, nulls skipped
fn joined_text(paragraphs: &Value) -> Option<String> {
    let parts: Vec<&str> = match paragraphs {
        Value::Array(items) => items
            .iter()
            .filter_map(|p| p.get(VALUE_KEY).and_then(Value::as_str))
            .collect(),
        _ => Vec::new(),
    };
    (!parts.is_empty()).then(|| parts.join(" "))
}
