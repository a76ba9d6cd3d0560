use chrono::{Datelike, Utc};
use reqwest::Url;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{Engine, RunContext, StepDone};
use crate::content::model::{
    ACF_APPRAISAL_TYPE, ACF_DOC_LINK, ACF_PDF_LINK, ACF_SESSION_ID, ACF_SHORTCODES_INSERTED,
    ACF_VALUE,
};
use crate::content::PostUpdate;
use crate::db::{self, NewStepEvent};
use crate::describer::check_merge_inputs;
use crate::error::PipelineError;
use crate::model::{AppraisalType, Step, StepOutcome};
use crate::notifier::{is_valid_email, Email};
use crate::record::Field;

/// Shortcodes every appraisal post body must carry.
pub fn shortcodes_for(kind: AppraisalType) -> Vec<String> {
    vec![
        format!("[AppraisalTemplates type=\"{}\"]", kind.as_str()),
        "[pdf_download]".to_string(),
    ]
}

/// Append the shortcodes `body` lacks. A body that already has all of them
/// comes back unchanged.
pub fn append_missing_shortcodes(body: &str, kind: AppraisalType) -> String {
    let mut out = body.trim_end().to_string();
    for code in shortcodes_for(kind) {
        if !out.contains(&code) {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&code);
        }
    }
    out
}

/// `<base>?email=<encoded>`; an unparseable base falls back to plain concatenation.
pub fn dashboard_link(base: &str, email: &str) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("email", email.trim());
            url.to_string()
        }
        Err(_) => format!("{base}?email={}", email.trim()),
    }
}

impl Engine {
    pub(super) async fn set_value_step(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        let id = ctx.id();
        let value = ctx.record.value.clone();
        self.services
            .sheet
            .write_span(
                id,
                Field::Value,
                vec![value.clone(), ctx.record.appraiser_description.clone()],
            )
            .await?;
        let post_id = ctx.record.post_id()?;
        self.services
            .content
            .update_post(post_id, PostUpdate::default().field(ACF_VALUE, value.as_str()))
            .await?;
        Ok(StepDone::Done(Some(format!("value {value}"))))
    }

    pub(super) async fn merge_descriptions(
        &self,
        ctx: &mut RunContext,
    ) -> Result<StepDone, PipelineError> {
        let appraiser = ctx.record.appraiser_description.clone();
        let ai = ctx.record.ai_description.clone();
        check_merge_inputs(&appraiser, &ai)?;

        let merged = self
            .services
            .describer
            .merge_descriptions(&appraiser, &ai)
            .await?;
        let merged = merged.trim().to_string();
        if merged.is_empty() {
            return Err(PipelineError::integrity("merge produced an empty description"));
        }
        self.services
            .sheet
            .write(ctx.id(), Field::MergedDescription, &merged)
            .await?;
        ctx.record.set(Field::MergedDescription, merged);
        Ok(StepDone::Done(None))
    }

    pub(super) async fn get_type(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        let raw = ctx.record.appraisal_type.as_str();
        let resolved = AppraisalType::resolve(raw);
        if !raw.is_empty() && AppraisalType::parse_type(raw).is_none() {
            warn!(raw, fallback = resolved.as_str(), "unknown appraisal type");
        }
        ctx.appraisal_type = resolved;
        Ok(StepDone::Done(Some(resolved.as_str().to_string())))
    }

    pub(super) async fn update_content(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        let post_id = ctx.record.post_id()?;
        let value = ctx.record.value.clone();
        let title = if ctx.record.merged_description.is_empty() {
            ctx.record.appraiser_description.clone()
        } else {
            ctx.record.merged_description.clone()
        };
        if value.is_empty() || title.is_empty() {
            return Err(PipelineError::integrity(format!(
                "record {} needs a value and a description before the post can be updated",
                ctx.id()
            )));
        }

        let post = self
            .services
            .content
            .update_post(
                post_id,
                PostUpdate::default()
                    .title(title)
                    .field(ACF_VALUE, value.as_str())
                    .field(ACF_APPRAISAL_TYPE, ctx.appraisal_type.as_str()),
            )
            .await?;

        if !post.link.is_empty() {
            self.services
                .sheet
                .write(ctx.id(), Field::PublicUrl, &post.link)
                .await?;
            ctx.record.set(Field::PublicUrl, post.link.clone());
        }
        Ok(StepDone::Done(Some(format!("post {post_id}"))))
    }

    pub(super) async fn insert_template(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        let post_id = ctx.record.post_id()?;
        let post = self.services.content.get_post(post_id).await?;
        if post.acf_flag(ACF_SHORTCODES_INSERTED) {
            return Ok(StepDone::Skipped("shortcodes already inserted".into()));
        }

        let body = append_missing_shortcodes(&post.content, ctx.appraisal_type);
        let mut update = PostUpdate::default().field(ACF_SHORTCODES_INSERTED, true);
        if body != post.content {
            update = update.content(body);
        }
        self.services.content.update_post(post_id, update).await?;
        Ok(StepDone::Done(None))
    }

    pub(super) async fn build_artifact(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        let post_id = ctx.record.post_id()?;
        let post = self.services.content.get_post(post_id).await?;
        let session_id = post
            .acf_str(ACF_SESSION_ID)
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::integrity(format!("post {post_id} has no {ACF_SESSION_ID}"))
            })?;

        let links = self.services.artifacts.build(post_id, &session_id).await?;
        self.services
            .sheet
            .write_span(
                ctx.id(),
                Field::PdfLink,
                vec![links.pdf_link.clone(), links.doc_link.clone()],
            )
            .await?;
        self.services
            .content
            .update_post(
                post_id,
                PostUpdate::default()
                    .field(ACF_PDF_LINK, links.pdf_link.as_str())
                    .field(ACF_DOC_LINK, links.doc_link.as_str()),
            )
            .await?;
        ctx.record.set(Field::PdfLink, links.pdf_link);
        ctx.record.set(Field::DocLink, links.doc_link);
        Ok(StepDone::Done(None))
    }

    pub(super) async fn notify_customer(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        let email = ctx.record.customer_email.trim().to_string();
        if !is_valid_email(&email) {
            return Err(PipelineError::integrity(format!(
                "record {} has an invalid customer email {email:?}",
                ctx.id()
            )));
        }

        let value = ctx.record.value.clone();
        let already_sent = db::step_succeeded_with(
            &self.pool,
            ctx.id(),
            Step::NotifyCustomer.as_str(),
            &value,
        )
        .await?;
        if already_sent {
            return Ok(StepDone::Skipped(format!(
                "customer already notified for value {value}"
            )));
        }

        let post_id = ctx.record.post_id()?;
        let post = self.services.content.get_post(post_id).await?;
        let public_url = if post.link.is_empty() {
            ctx.record.public_url.clone()
        } else {
            post.link
        };

        let mut vars = Map::new();
        vars.insert("customer_name".into(), json!(ctx.record.customer_name));
        vars.insert("appraisal_value".into(), json!(value));
        vars.insert("description".into(), json!(ctx.record.merged_description));
        vars.insert("pdf_link".into(), json!(ctx.record.pdf_link));
        vars.insert("wp_link".into(), json!(public_url));
        vars.insert(
            "dashboard_link".into(),
            json!(dashboard_link(&self.settings.dashboard_url, &email)),
        );
        vars.insert("current_year".into(), Value::from(Utc::now().year()));

        self.services
            .notifier
            .send(&Email {
                template_id: self.settings.completed_template_id.clone(),
                to: email,
                variables: vars,
                send_at: None,
            })
            .await?;
        info!(record_id = ctx.id(), "completion email sent");

        // Recorded before the status checkpoint: a later failure in this run
        // must not lead redelivery to send the email again.
        db::append_step_event(
            &self.pool,
            &NewStepEvent {
                run_id: &ctx.run_id,
                record_id: ctx.id(),
                step: Step::NotifyCustomer.as_str(),
                outcome: StepOutcome::Succeeded.as_str(),
                actor: &ctx.actor,
                detail: None,
                fingerprint: Some(&value),
            },
        )
        .await?;
        Ok(StepDone::Journaled(None))
    }

    pub(super) async fn complete(&self, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        self.services
            .sheet
            .write_span(
                ctx.id(),
                Field::Value,
                vec![
                    ctx.record.value.clone(),
                    ctx.record.appraiser_description.clone(),
                ],
            )
            .await?;
        Ok(StepDone::Done(None))
    }
}
