//! Intake: a new submission lands on an existing pending row.
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use crate::error::PipelineError;
use crate::notifier::{is_valid_email, Email};
use crate::pipeline::{dashboard_link, Engine};
use crate::record::Field;

/// Body of `POST /update-pending-appraisal`.
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    #[serde(default)]
    pub post_id: Option<serde_json::Value>,
    pub post_edit_url: String,
    pub customer_email: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeOutcome {
    pub record_id: u32,
    pub ai_description: Option<String>,
}

impl IntakeRequest {
    /// `post_id` arrives as a number or a numeric string.
    pub fn declared_post_id(&self) -> Option<u64> {
        match self.post_id.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.session_id.trim().is_empty() {
            return Err(PipelineError::validation("session_id is required"));
        }
        if self.post_edit_url.trim().is_empty() {
            return Err(PipelineError::validation("post_edit_url is required"));
        }
        if !is_valid_email(&self.customer_email) {
            return Err(PipelineError::validation("customer_email is invalid"));
        }
        Ok(())
    }
}

impl Engine {
    /// Attach a submission to its pending row, describe the main image and
    /// schedule the "update" email.
    #[instrument(skip_all, fields(session = %req.session_id))]
    pub async fn ingest(&self, req: &IntakeRequest) -> Result<IntakeOutcome, PipelineError> {
        req.validate()?;
        let sheet = self.sheet();
        let record = sheet
            .find_by_identifier(&req.session_id)
            .await?
            .ok_or_else(|| {
                PipelineError::integrity(format!("no pending record for session {}", req.session_id))
            })?;
        let id = record.id;
        // The post id must be recoverable before anything is written.
        let post_id = crate::record::post_id_from_url(&req.post_edit_url)?;
        if let Some(declared) = req.declared_post_id() {
            if declared != post_id {
                return Err(PipelineError::validation(format!(
                    "post_id {declared} does not match post_edit_url (post {post_id})"
                )));
            }
        }

        let images = serde_json::to_string(&req.images)
            .map_err(|err| PipelineError::Internal(err.into()))?;
        sheet.write(id, Field::ContentUrl, req.post_edit_url.trim()).await?;
        sheet
            .write(id, Field::CustomerDescription, req.description.trim())
            .await?;
        sheet.write(id, Field::ImagesJson, &images).await?;
        sheet.write(id, Field::Status, "Pending").await?;

        let ai_description = match req.images.get("main").filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                let text = self.describer().describe_image(url).await?;
                sheet.write(id, Field::AiDescription, &text).await?;
                Some(text)
            }
            None => {
                warn!(id, "submission has no main image; skipping description");
                None
            }
        };

        let settings = self.settings();
        let mut vars = Map::new();
        vars.insert("customer_name".into(), json!(record.customer_name));
        vars.insert("description".into(), json!(req.description));
        vars.insert(
            "dashboard_link".into(),
            json!(dashboard_link(&settings.dashboard_url, &req.customer_email)),
        );
        let delay = chrono::Duration::from_std(settings.update_delay)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.notifier()
            .send(&Email {
                template_id: settings.update_template_id.clone(),
                to: req.customer_email.trim().to_string(),
                variables: vars,
                send_at: Some(Utc::now() + delay),
            })
            .await?;

        info!(id, "submission attached to pending record");
        Ok(IntakeOutcome {
            record_id: id,
            ai_description,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> IntakeRequest {
        serde_json::from_value(json!({
            "description": "Old painting from my grandmother",
            "images": { "main": "https://img/main.jpg" },
            "post_id": 987,
            "post_edit_url": "https://cms.test/wp-admin/post.php?post=987&action=edit",
            "customer_email": "jane@example.com",
            "session_id": "sess-1"
        }))
        .unwrap()
    }

    #[test]
    fn accepts_complete_submission() {
        request().validate().unwrap();
    }

    #[test]
    fn post_id_accepts_number_or_string() {
        assert_eq!(request().declared_post_id(), Some(987));
        let mut req = request();
        req.post_id = Some(json!("12"));
        assert_eq!(req.declared_post_id(), Some(12));
        req.post_id = None;
        assert_eq!(req.declared_post_id(), None);
    }

    #[test]
    fn rejects_missing_session_or_bad_email() {
        let mut req = request();
        req.session_id = " ".into();
        assert!(matches!(req.validate(), Err(PipelineError::Validation(_))));

        let mut req = request();
        req.customer_email = "nobody".into();
        assert!(matches!(req.validate(), Err(PipelineError::Validation(_))));
    }
}
