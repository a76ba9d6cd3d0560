//! Appraisal row layout in the record store and helpers for addressing it.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PipelineError;

/// Columns of an appraisal row, in sheet order starting at column A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Date,
    AppraisalType,
    Identifier,
    CustomerEmail,
    CustomerName,
    Status,
    ContentUrl,
    AiDescription,
    CustomerDescription,
    Value,
    AppraiserDescription,
    MergedDescription,
    PdfLink,
    DocLink,
    ImagesJson,
    PublicUrl,
}

impl Field {
    pub const ALL: [Field; 16] = [
        Field::Date,
        Field::AppraisalType,
        Field::Identifier,
        Field::CustomerEmail,
        Field::CustomerName,
        Field::Status,
        Field::ContentUrl,
        Field::AiDescription,
        Field::CustomerDescription,
        Field::Value,
        Field::AppraiserDescription,
        Field::MergedDescription,
        Field::PdfLink,
        Field::DocLink,
        Field::ImagesJson,
        Field::PublicUrl,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn column(&self) -> char {
        (b'A' + self.index() as u8) as char
    }
}

pub const FIRST_COLUMN: Field = Field::Date;
pub const LAST_COLUMN: Field = Field::PublicUrl;
/// Row 1 holds headers.
pub const FIRST_DATA_ROW: u32 = 2;

fn quoted(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

/// `'Sheet'!A42:P42`
pub fn row_range(sheet: &str, row: u32) -> String {
    span_range(sheet, FIRST_COLUMN, LAST_COLUMN, row)
}

/// `'Sheet'!J42`
pub fn cell_range(sheet: &str, field: Field, row: u32) -> String {
    format!("{}!{}{}", quoted(sheet), field.column(), row)
}

/// `'Sheet'!J42:K42`
pub fn span_range(sheet: &str, from: Field, to: Field, row: u32) -> String {
    format!(
        "{}!{}{}:{}{}",
        quoted(sheet),
        from.column(),
        row,
        to.column(),
        row
    )
}

/// `'Sheet'!A2:P`, every data row.
pub fn table_range(sheet: &str) -> String {
    format!(
        "{}!{}{}:{}",
        quoted(sheet),
        FIRST_COLUMN.column(),
        FIRST_DATA_ROW,
        LAST_COLUMN.column()
    )
}

/// One appraisal row. `id` is the sheet row number.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppraisalRecord {
    pub id: u32,
    pub date: String,
    pub appraisal_type: String,
    pub identifier: String,
    pub customer_email: String,
    pub customer_name: String,
    pub status: String,
    pub content_url: String,
    pub ai_description: String,
    pub customer_description: String,
    pub value: String,
    pub appraiser_description: String,
    pub merged_description: String,
    pub pdf_link: String,
    pub doc_link: String,
    pub images_json: String,
    pub public_url: String,
}

impl AppraisalRecord {
    /// Build from a row of cell values; missing trailing cells read as empty.
    pub fn from_row(id: u32, row: &[String]) -> Self {
        let cell = |f: Field| row.get(f.index()).map(|s| s.trim().to_string()).unwrap_or_default();
        Self {
            id,
            date: cell(Field::Date),
            appraisal_type: cell(Field::AppraisalType),
            identifier: cell(Field::Identifier),
            customer_email: cell(Field::CustomerEmail),
            customer_name: cell(Field::CustomerName),
            status: cell(Field::Status),
            content_url: cell(Field::ContentUrl),
            ai_description: cell(Field::AiDescription),
            customer_description: cell(Field::CustomerDescription),
            value: cell(Field::Value),
            appraiser_description: cell(Field::AppraiserDescription),
            merged_description: cell(Field::MergedDescription),
            pdf_link: cell(Field::PdfLink),
            doc_link: cell(Field::DocLink),
            images_json: cell(Field::ImagesJson),
            public_url: cell(Field::PublicUrl),
        }
    }

    pub fn to_row(&self) -> Vec<String> {
        Field::ALL.iter().map(|f| self.get(*f).to_string()).collect()
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Date => &self.date,
            Field::AppraisalType => &self.appraisal_type,
            Field::Identifier => &self.identifier,
            Field::CustomerEmail => &self.customer_email,
            Field::CustomerName => &self.customer_name,
            Field::Status => &self.status,
            Field::ContentUrl => &self.content_url,
            Field::AiDescription => &self.ai_description,
            Field::CustomerDescription => &self.customer_description,
            Field::Value => &self.value,
            Field::AppraiserDescription => &self.appraiser_description,
            Field::MergedDescription => &self.merged_description,
            Field::PdfLink => &self.pdf_link,
            Field::DocLink => &self.doc_link,
            Field::ImagesJson => &self.images_json,
            Field::PublicUrl => &self.public_url,
        }
    }

    pub fn set(&mut self, field: Field, value: impl Into<String>) {
        let value = value.into();
        match field {
            Field::Date => self.date = value,
            Field::AppraisalType => self.appraisal_type = value,
            Field::Identifier => self.identifier = value,
            Field::CustomerEmail => self.customer_email = value,
            Field::CustomerName => self.customer_name = value,
            Field::Status => self.status = value,
            Field::ContentUrl => self.content_url = value,
            Field::AiDescription => self.ai_description = value,
            Field::CustomerDescription => self.customer_description = value,
            Field::Value => self.value = value,
            Field::AppraiserDescription => self.appraiser_description = value,
            Field::MergedDescription => self.merged_description = value,
            Field::PdfLink => self.pdf_link = value,
            Field::DocLink => self.doc_link = value,
            Field::ImagesJson => self.images_json = value,
            Field::PublicUrl => self.public_url = value,
        }
    }

    /// Image role -> URL. Unparseable JSON reads as no images.
    pub fn images(&self) -> BTreeMap<String, String> {
        if self.images_json.is_empty() {
            return BTreeMap::new();
        }
        serde_json::from_str(&self.images_json).unwrap_or_default()
    }

    /// Content Post id encoded in `contentUrl`.
    pub fn post_id(&self) -> Result<u64, PipelineError> {
        post_id_from_url(&self.content_url)
    }

    pub fn is_blank(&self) -> bool {
        Field::ALL.iter().all(|f| self.get(*f).is_empty())
    }
}

/// Extract the `post` query parameter from a content URL such as
/// `https://host/wp-admin/post.php?post=987&action=edit`.
pub fn post_id_from_url(url: &str) -> Result<u64, PipelineError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(PipelineError::integrity("content URL is empty"));
    }
    let parsed = Url::parse(url)
        .map_err(|err| PipelineError::integrity(format!("content URL {url:?} is not a URL: {err}")))?;
    let raw = parsed
        .query_pairs()
        .find(|(k, _)| k == "post")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| {
            PipelineError::integrity(format!("content URL {url:?} has no post parameter"))
        })?;
    raw.trim()
        .parse::<u64>()
        .map_err(|_| PipelineError::integrity(format!("content URL post id {raw:?} is not numeric")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_follow_declaration_order() {
        assert_eq!(Field::Date.column(), 'A');
        assert_eq!(Field::Status.column(), 'F');
        assert_eq!(Field::Value.column(), 'J');
        assert_eq!(Field::ImagesJson.column(), 'O');
        assert_eq!(Field::PublicUrl.column(), 'P');
    }

    #[test]
    fn ranges_quote_sheet_names() {
        assert_eq!(row_range("Pending Appraisals", 42), "'Pending Appraisals'!A42:P42");
        assert_eq!(cell_range("Pending", Field::Value, 7), "'Pending'!J7");
        assert_eq!(
            span_range("Pending", Field::PdfLink, Field::DocLink, 3),
            "'Pending'!M3:N3"
        );
        assert_eq!(table_range("O'Brien"), "'O''Brien'!A2:P");
    }

    #[test]
    fn short_rows_read_as_empty() {
        let row: Vec<String> = vec!["2024-01-01".into(), "FastTrack".into(), "sess-1".into()];
        let rec = AppraisalRecord::from_row(5, &row);
        assert_eq!(rec.id, 5);
        assert_eq!(rec.identifier, "sess-1");
        assert!(rec.value.is_empty());
        assert_eq!(rec.to_row().len(), Field::ALL.len());
    }

    #[test]
    fn post_id_is_extracted() {
        assert_eq!(post_id_from_url("https://x/?post=987").unwrap(), 987);
        assert_eq!(
            post_id_from_url("https://x/wp-admin/post.php?post=12&action=edit").unwrap(),
            12
        );
    }

    #[test]
    fn bad_content_urls_are_integrity_errors() {
        for url in ["", "https://x/?page=3", "not a url", "https://x/?post=abc"] {
            let err = post_id_from_url(url).unwrap_err();
            assert!(
                matches!(err, PipelineError::DataIntegrity(_)),
                "{url:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn images_parse_from_json() {
        let rec = AppraisalRecord {
            images_json: r#"{"main":"https://img/main.jpg","signature":"https://img/sig.jpg"}"#.into(),
            ..Default::default()
        };
        assert_eq!(rec.images().get("main").map(String::as_str), Some("https://img/main.jpg"));
        let broken = AppraisalRecord {
            images_json: "{oops".into(),
            ..Default::default()
        };
        assert!(broken.images().is_empty());
    }
}
