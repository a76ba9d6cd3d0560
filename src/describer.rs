//! Description generator backed by a vision-capable chat completion API.
use async_trait::async_trait;
use reqwest::{Client, Request, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::instrument;

use crate::error::ServiceError;
use crate::http;
use crate::retry::RetryPolicy;

const SERVICE: &str = "describer";
const TIMEOUT: Duration = Duration::from_secs(30);

const DESCRIBE_PROMPT: &str = "You are an art appraisal assistant. Describe the artwork in this \
image for a formal appraisal record: subject, medium, style, apparent period and condition. \
Write plain prose without headings.";

const MERGE_PROMPT: &str = "You are an art appraisal assistant. Merge the appraiser's description \
and the AI-generated description below into one concise title-style description. Where they \
disagree, the appraiser's description wins. Return plain prose only.";

#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    async fn describe_image(&self, image_url: &str) -> Result<String, ServiceError>;

    async fn merge_descriptions(
        &self,
        appraiser: &str,
        ai: &str,
    ) -> Result<String, ServiceError>;
}

/// Both sources must carry text; an empty side would silently produce a
/// one-sided "merge".
pub fn check_merge_inputs(appraiser: &str, ai: &str) -> Result<(), ServiceError> {
    let missing: Vec<&str> = [("appraiser description", appraiser), ("AI description", ai)]
        .into_iter()
        .filter(|(_, text)| text.trim().is_empty())
        .map(|(name, _)| name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput {
            service: SERVICE,
            message: format!("empty merge source: {}", missing.join(", ")),
        })
    }
}

/// Trim generated text to at most `max_words` words.
pub fn clamp_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return words.join(" ");
    }
    let mut out = words[..max_words].join(" ");
    out = out
        .trim_end_matches(|c: char| c == ',' || c == ';' || c == ':')
        .to_string();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiDescriber {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    max_words: u32,
    retry: RetryPolicy,
}

impl fmt::Debug for OpenAiDescriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiDescriber")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiDescriber {
    pub fn new(
        base_url: Url,
        api_key: String,
        model: String,
        max_words: u32,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client(SERVICE, TIMEOUT)?,
            base_url,
            api_key,
            model,
            max_words,
            retry: RetryPolicy::default(),
        })
    }

    fn chat_request(&self, system: &str, user: Value) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            // Roughly 1.5 tokens per word leaves room to finish a sentence.
            max_tokens: self.max_words * 3 / 2 + 32,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Value::String(format!(
                        "{system} Use at most {} words.",
                        self.max_words
                    )),
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        }
    }

    fn build_describe(&self, image_url: &str) -> ChatRequest {
        self.chat_request(
            DESCRIBE_PROMPT,
            json!([
                { "type": "text", "text": "Describe this artwork." },
                { "type": "image_url", "image_url": { "url": image_url } }
            ]),
        )
    }

    fn build_merge(&self, appraiser: &str, ai: &str) -> ChatRequest {
        self.chat_request(
            MERGE_PROMPT,
            Value::String(format!(
                "Appraiser description:\n{appraiser}\n\nAI description:\n{ai}"
            )),
        )
    }

    pub fn build_request(&self, body: &impl Serialize) -> Result<Request, ServiceError> {
        let url = self
            .base_url
            .join("v1/chat/completions")
            .map_err(|err| ServiceError::malformed(SERVICE, err.to_string()))?;
        self.http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }

    async fn complete(&self, req: ChatRequest) -> Result<String, ServiceError> {
        let body = http::send(&self.http, &self.retry, SERVICE, || self.build_request(&req)).await?;
        let text = parse_reply(&body)?;
        Ok(clamp_words(&text, self.max_words as usize))
    }
}

fn parse_reply(body: &str) -> Result<String, ServiceError> {
    let parsed: ChatResponse = http::decode(SERVICE, body)?;
    parsed
        .choices
        .into_iter()
        .find_map(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::malformed(SERVICE, "no text content in response"))
}

#[async_trait]
impl DescriptionGenerator for OpenAiDescriber {
    #[instrument(skip(self))]
    async fn describe_image(&self, image_url: &str) -> Result<String, ServiceError> {
        if image_url.trim().is_empty() {
            return Err(ServiceError::InvalidInput {
                service: SERVICE,
                message: "image URL is empty".into(),
            });
        }
        self.complete(self.build_describe(image_url)).await
    }

    #[instrument(skip_all)]
    async fn merge_descriptions(
        &self,
        appraiser: &str,
        ai: &str,
    ) -> Result<String, ServiceError> {
        check_merge_inputs(appraiser, ai)?;
        self.complete(self.build_merge(appraiser, ai)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describer() -> OpenAiDescriber {
        OpenAiDescriber::new(
            Url::parse("https://llm.test/").unwrap(),
            "key".into(),
            "gpt-4o".into(),
            50,
        )
        .unwrap()
    }

    #[test]
    fn empty_merge_sources_are_flagged() {
        let err = check_merge_inputs("", "").unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput { .. }));
        assert!(err.to_string().contains("appraiser description, AI description"));
        assert!(check_merge_inputs("Oil on canvas", "  ").is_err());
        assert!(check_merge_inputs("Oil on canvas", "A landscape").is_ok());
    }

    #[test]
    fn clamp_keeps_short_text() {
        assert_eq!(clamp_words("  A  small   sketch. ", 10), "A small sketch.");
        assert_eq!(clamp_words("one two, three four", 2), "one two.");
    }

    #[test]
    fn describe_request_carries_image() {
        let d = describer();
        let req = d.build_describe("https://img/main.jpg");
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["model"], "gpt-4o");
        assert_eq!(v["messages"][1]["content"][1]["image_url"]["url"], "https://img/main.jpg");
        assert!(v["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("at most 50 words"));

        let http_req = d.build_request(&req).unwrap();
        assert_eq!(http_req.url().path(), "/v1/chat/completions");
    }

    #[test]
    fn merge_request_includes_both_sources() {
        let v = serde_json::to_value(describer().build_merge("Oil on canvas", "A landscape")).unwrap();
        let user = v["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("Oil on canvas"));
        assert!(user.contains("A landscape"));
    }

    #[test]
    fn reply_without_text_is_malformed() {
        let err = parse_reply(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap_err();
        assert!(matches!(err, ServiceError::Malformed { .. }));
        assert_eq!(
            parse_reply(r#"{"choices":[{"message":{"content":" Done. "}}]}"#).unwrap(),
            "Done."
        );
    }
}
