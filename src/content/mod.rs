//! Content system adapter: the headless CMS post behind each appraisal.
use async_trait::async_trait;
use reqwest::{Client, Request, Url};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::ServiceError;
use crate::http;
use crate::retry::RetryPolicy;

pub mod model;

pub use model::{Post, PostUpdate};
use model::WirePost;

const SERVICE: &str = "content";
const TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ContentService: Send + Sync {
    async fn get_post(&self, post_id: u64) -> Result<Post, ServiceError>;

    /// Send a write body to the post as-is.
    async fn write_post(&self, post_id: u64, body: Value) -> Result<Post, ServiceError>;

    /// Partial update. Custom fields are read fresh and merged so fields
    /// unrelated to this update survive.
    async fn update_post(&self, post_id: u64, update: PostUpdate) -> Result<Post, ServiceError> {
        let current = if update.acf.is_empty() {
            None
        } else {
            Some(self.get_post(post_id).await?)
        };
        let body = build_update_body(current.as_ref().map(|p| &p.acf), &update);
        self.write_post(post_id, body).await
    }
}

/// Merge `update` over the current custom-field bag and build the write body.
pub fn build_update_body(current_acf: Option<&Map<String, Value>>, update: &PostUpdate) -> Value {
    let mut body = Map::new();
    if let Some(title) = &update.title {
        body.insert("title".into(), Value::String(title.clone()));
    }
    if let Some(content) = &update.content {
        body.insert("content".into(), Value::String(content.clone()));
    }
    if !update.acf.is_empty() {
        let mut acf = current_acf.cloned().unwrap_or_default();
        for (k, v) in &update.acf {
            acf.insert(k.clone(), v.clone());
        }
        body.insert("acf".into(), Value::Object(acf));
    }
    Value::Object(body)
}

#[derive(Clone)]
pub struct WordPressClient {
    http: Client,
    base_url: Url,
    post_type: String,
    username: String,
    password: String,
    retry: RetryPolicy,
}

impl fmt::Debug for WordPressClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordPressClient")
            .field("base_url", &self.base_url)
            .field("post_type", &self.post_type)
            .finish_non_exhaustive()
    }
}

impl WordPressClient {
    pub fn new(
        base_url: Url,
        post_type: String,
        username: String,
        password: String,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client(SERVICE, TIMEOUT)?,
            base_url,
            post_type,
            username,
            password,
            retry: RetryPolicy::default(),
        })
    }

    fn post_url(&self, post_id: u64) -> Result<Url, ServiceError> {
        let path = format!("{}/{}", self.post_type.trim_matches('/'), post_id);
        self.base_url
            .join(&path)
            .map_err(|err| ServiceError::malformed(SERVICE, err.to_string()))
    }

    pub fn build_get(&self, post_id: u64) -> Result<Request, ServiceError> {
        let mut url = self.post_url(post_id)?;
        url.query_pairs_mut().append_pair("context", "edit");
        self.http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }

    pub fn build_write(&self, post_id: u64, body: &Value) -> Result<Request, ServiceError> {
        let mut url = self.post_url(post_id)?;
        url.query_pairs_mut().append_pair("context", "edit");
        self.http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }
}

#[async_trait]
impl ContentService for WordPressClient {
    #[instrument(skip(self))]
    async fn get_post(&self, post_id: u64) -> Result<Post, ServiceError> {
        let body = http::send(&self.http, &self.retry, SERVICE, || self.build_get(post_id)).await?;
        let wire: WirePost = http::decode(SERVICE, &body)?;
        Ok(wire.into())
    }

    #[instrument(skip(self, body))]
    async fn write_post(&self, post_id: u64, body: Value) -> Result<Post, ServiceError> {
        debug!(post_id, fields = ?body.as_object().map(|m| m.keys().cloned().collect::<Vec<_>>()), "writing post");
        let res = http::send(&self.http, &self.retry, SERVICE, || {
            self.build_write(post_id, &body)
        })
        .await?;
        let wire: WirePost = http::decode(SERVICE, &res)?;
        Ok(wire.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> WordPressClient {
        WordPressClient::new(
            Url::parse("https://cms.test/wp-json/wp/v2/").unwrap(),
            "appraisals".into(),
            "user".into(),
            "secret".into(),
        )
        .unwrap()
    }

    #[test]
    fn build_get_uses_basic_auth_and_edit_context() {
        let request = client().build_get(987).unwrap();
        assert_eq!(request.url().path(), "/wp-json/wp/v2/appraisals/987");
        assert_eq!(request.url().query(), Some("context=edit"));
        let auth = request
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .unwrap();
        assert!(auth.starts_with("Basic "));
    }

    #[test]
    fn update_body_merges_custom_fields() {
        let current = json!({ "session_id": "sess-1", "value": "100" });
        let update = PostUpdate::default()
            .title("Merged description")
            .field(model::ACF_VALUE, "1200");
        let body = build_update_body(current.as_object(), &update);
        assert_eq!(body["title"], "Merged description");
        assert_eq!(body["acf"]["value"], "1200");
        assert_eq!(body["acf"]["session_id"], "sess-1");
        assert!(body.get("content").is_none());
    }

    #[test]
    fn update_body_without_fields_omits_bag() {
        let update = PostUpdate::default().content("<p>body</p>");
        let body = build_update_body(None, &update);
        assert_eq!(body, json!({ "content": "<p>body</p>" }));
    }

    #[test]
    fn wire_post_prefers_raw_text_and_tolerates_empty_bag() {
        let wire: WirePost = serde_json::from_value(json!({
            "id": 5,
            "title": { "raw": "Raw", "rendered": "<b>Raw</b>" },
            "content": { "rendered": "<p>x</p>" },
            "link": "https://cms.test/appraisals/5",
            "acf": []
        }))
        .unwrap();
        let post: Post = wire.into();
        assert_eq!(post.title, "Raw");
        assert_eq!(post.content, "<p>x</p>");
        assert!(post.acf.is_empty());
    }

    #[test]
    fn flags_accept_loose_encodings() {
        let mut post = Post::default();
        assert!(!post.acf_flag(model::ACF_SHORTCODES_INSERTED));
        for v in [json!(true), json!(1), json!("1"), json!("true")] {
            post.acf.insert(model::ACF_SHORTCODES_INSERTED.into(), v);
            assert!(post.acf_flag(model::ACF_SHORTCODES_INSERTED));
        }
        post.acf.insert(model::ACF_SHORTCODES_INSERTED.into(), json!(false));
        assert!(!post.acf_flag(model::ACF_SHORTCODES_INSERTED));
    }
}
