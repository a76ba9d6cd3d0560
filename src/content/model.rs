use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Custom-field keys the pipeline reads or writes.
pub const ACF_VALUE: &str = "value";
pub const ACF_APPRAISAL_TYPE: &str = "appraisaltype";
pub const ACF_SESSION_ID: &str = "session_id";
pub const ACF_PDF_LINK: &str = "pdflink";
pub const ACF_DOC_LINK: &str = "doclink";
pub const ACF_SHORTCODES_INSERTED: &str = "shortcodes_inserted";

/// Content Post as the pipeline sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: u64,
    pub title: String,
    pub content: String,
    /// Public URL of the post.
    pub link: String,
    pub acf: Map<String, Value>,
}

impl Post {
    pub fn acf_str(&self, key: &str) -> Option<&str> {
        self.acf
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Custom-field flags arrive as `true`, `1`, `"1"` or `"true"`
    /// depending on how the field was last written.
    pub fn acf_flag(&self, key: &str) -> bool {
        match self.acf.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "yes"),
            _ => false,
        }
    }
}

/// Partial update. Only fields set here are sent; custom fields are merged
/// into the bag currently stored on the post.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub acf: Map<String, Value>,
}

impl PostUpdate {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.acf.insert(key.to_string(), value.into());
        self
    }
}

/// `{ "raw": ..., "rendered": ... }` as returned with `context=edit`.
#[derive(Debug, Deserialize, Default)]
pub(crate) struct WireText {
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub rendered: String,
}

impl WireText {
    fn text(self) -> String {
        self.raw.unwrap_or(self.rendered)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePost {
    pub id: u64,
    #[serde(default)]
    pub title: WireText,
    #[serde(default)]
    pub content: WireText,
    #[serde(default)]
    pub link: String,
    /// The CMS sends `[]` instead of `{}` for an empty bag.
    #[serde(default)]
    pub acf: Value,
}

impl From<WirePost> for Post {
    fn from(w: WirePost) -> Self {
        let acf = match w.acf {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Post {
            id: w.id,
            title: w.title.text(),
            content: w.content.text(),
            link: w.link,
            acf,
        }
    }
}
