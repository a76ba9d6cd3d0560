//! Artifact builder: external PDF/document generation.
use async_trait::async_trait;
use reqwest::{Client, Request, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::http;
use crate::retry::RetryPolicy;

const SERVICE: &str = "artifacts";
// Generation renders the whole post; it is the slowest call in the pipeline.
const TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    pub pdf_link: String,
    pub doc_link: String,
}

#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, post_id: u64, session_id: &str) -> Result<Artifacts, ServiceError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildResponse {
    #[serde(default)]
    pdf_link: Option<String>,
    #[serde(default)]
    doc_link: Option<String>,
}

fn parse_links(body: &str) -> Result<Artifacts, ServiceError> {
    let parsed: BuildResponse = http::decode(SERVICE, body)?;
    let non_empty = |v: Option<String>, name: &str| {
        v.map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ServiceError::malformed(SERVICE, format!("response has no {name}")))
    };
    Ok(Artifacts {
        pdf_link: non_empty(parsed.pdf_link, "pdfLink")?,
        doc_link: non_empty(parsed.doc_link, "docLink")?,
    })
}

#[derive(Clone)]
pub struct HttpArtifactBuilder {
    http: Client,
    endpoint: Url,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpArtifactBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpArtifactBuilder")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpArtifactBuilder {
    pub fn new(endpoint: Url) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client(SERVICE, TIMEOUT)?,
            endpoint,
            // A timed-out generation may still be running upstream; retry once at most.
            retry: RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
        })
    }

    pub fn build_request(&self, post_id: u64, session_id: &str) -> Result<Request, ServiceError> {
        self.http
            .post(self.endpoint.clone())
            .json(&json!({ "postId": post_id, "session_ID": session_id }))
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }
}

#[async_trait]
impl ArtifactBuilder for HttpArtifactBuilder {
    #[instrument(skip(self))]
    async fn build(&self, post_id: u64, session_id: &str) -> Result<Artifacts, ServiceError> {
        let body = http::send(&self.http, &self.retry, SERVICE, || {
            self.build_request(post_id, session_id)
        })
        .await?;
        let links = parse_links(&body)?;
        info!(post_id, pdf = %links.pdf_link, "artifacts generated");
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_names_post_and_session() {
        let builder =
            HttpArtifactBuilder::new(Url::parse("https://docs.test/generate-pdf").unwrap()).unwrap();
        let req = builder.build_request(987, "sess-1").unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        let sent: serde_json::Value =
            serde_json::from_slice(req.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(sent["postId"], 987);
        assert_eq!(sent["session_ID"], "sess-1");
    }

    #[test]
    fn links_must_be_present() {
        let ok = parse_links(r#"{"pdfLink":"https://d/a.pdf","docLink":"https://d/a.docx"}"#).unwrap();
        assert_eq!(ok.doc_link, "https://d/a.docx");

        let err = parse_links(r#"{"pdfLink":"https://d/a.pdf","docLink":""}"#).unwrap_err();
        assert!(err.to_string().contains("docLink"));
        assert!(parse_links("<html>").is_err());
    }
}
