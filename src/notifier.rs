//! Templated transactional email.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Request, Url};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::ServiceError;
use crate::http;
use crate::retry::RetryPolicy;

const SERVICE: &str = "notifier";
const TIMEOUT: Duration = Duration::from_secs(10);

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex")
});

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email.trim())
}

/// One templated message.
#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub template_id: String,
    pub to: String,
    pub variables: Map<String, Value>,
    /// Deliver no earlier than this instant.
    pub send_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct SendGridNotifier {
    http: Client,
    base_url: Url,
    api_key: String,
    sender_email: String,
    sender_name: String,
    retry: RetryPolicy,
}

impl fmt::Debug for SendGridNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendGridNotifier")
            .field("base_url", &self.base_url)
            .field("sender_email", &self.sender_email)
            .finish_non_exhaustive()
    }
}

impl SendGridNotifier {
    pub fn new(
        base_url: Url,
        api_key: String,
        sender_email: String,
        sender_name: String,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            http: http::client(SERVICE, TIMEOUT)?,
            base_url,
            api_key,
            sender_email,
            sender_name,
            retry: RetryPolicy::default(),
        })
    }

    pub fn build_body(&self, email: &Email) -> Value {
        let mut body = json!({
            "from": { "email": self.sender_email, "name": self.sender_name },
            "personalizations": [{
                "to": [{ "email": email.to.trim() }],
                "dynamic_template_data": Value::Object(email.variables.clone()),
            }],
            "template_id": email.template_id,
        });
        if let Some(at) = email.send_at {
            body["send_at"] = json!(at.timestamp());
        }
        body
    }

    pub fn build_request(&self, body: &Value) -> Result<Request, ServiceError> {
        let url = self
            .base_url
            .join("v3/mail/send")
            .map_err(|err| ServiceError::malformed(SERVICE, err.to_string()))?;
        self.http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .build()
            .map_err(|err| ServiceError::from_reqwest(SERVICE, err))
    }
}

#[async_trait]
impl Notifier for SendGridNotifier {
    #[instrument(skip_all, fields(template = %email.template_id))]
    async fn send(&self, email: &Email) -> Result<(), ServiceError> {
        if !is_valid_email(&email.to) {
            return Err(ServiceError::InvalidInput {
                service: SERVICE,
                message: format!("invalid recipient {:?}", email.to),
            });
        }
        let body = self.build_body(email);
        http::send(&self.http, &self.retry, SERVICE, || self.build_request(&body)).await?;
        info!(send_at = ?email.send_at, "email accepted for delivery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn notifier() -> SendGridNotifier {
        SendGridNotifier::new(
            Url::parse("https://mail.test/").unwrap(),
            "key".into(),
            "appraisals@example.com".into(),
            "Appraisal Team".into(),
        )
        .unwrap()
    }

    #[test]
    fn validates_email_shape() {
        assert!(is_valid_email("jane@example.com"));
        assert!(is_valid_email(" jane.doe+art@mail.example.org "));
        assert!(!is_valid_email("jane@"));
        assert!(!is_valid_email("jane example.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn body_carries_template_and_schedule() {
        let mut vars = Map::new();
        vars.insert("appraisal_value".into(), json!("1200"));
        let email = Email {
            template_id: "d-completed".into(),
            to: "jane@example.com".into(),
            variables: vars,
            send_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
        };
        let body = notifier().build_body(&email);
        assert_eq!(body["template_id"], "d-completed");
        assert_eq!(body["personalizations"][0]["to"][0]["email"], "jane@example.com");
        assert_eq!(
            body["personalizations"][0]["dynamic_template_data"]["appraisal_value"],
            "1200"
        );
        assert_eq!(body["send_at"], 1740830400);
    }

    #[test]
    fn immediate_send_omits_schedule() {
        let email = Email {
            template_id: "d-update".into(),
            to: "jane@example.com".into(),
            variables: Map::new(),
            send_at: None,
        };
        let body = notifier().build_body(&email);
        assert!(body.get("send_at").is_none());
        let req = notifier().build_request(&body).unwrap();
        assert_eq!(req.url().path(), "/v3/mail/send");
    }
}
