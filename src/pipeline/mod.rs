//! The appraisal pipeline: an ordered run of side-effecting steps for one
//! record, journaled to SQLite and checkpointed into the record store.
//!
//! Every step overwrites fixed cells or fields, so re-running a step after
//! redelivery is safe. `INSERT_TEMPLATE` keeps an explicit flag on the post
//! and `NOTIFY_CUSTOMER` records the send in the step history as soon as it
//! happens, so redelivery never mails the customer twice.
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::artifacts::{ArtifactBuilder, HttpArtifactBuilder};
use crate::config::Config;
use crate::content::{ContentService, WordPressClient};
use crate::db::{self, NewStepEvent, Pool};
use crate::describer::{DescriptionGenerator, OpenAiDescriber};
use crate::error::{PipelineError, ServiceError};
use crate::model::{AppraisalType, RunState, Step, StepOutcome};
use crate::notifier::{Notifier, SendGridNotifier};
use crate::record::{AppraisalRecord, Field};
use crate::sheets::{AppraisalSheet, SheetsClient};

mod steps;

pub use steps::{append_missing_shortcodes, dashboard_link, shortcodes_for};

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Services {
    pub sheet: AppraisalSheet,
    pub content: Arc<dyn ContentService>,
    pub describer: Arc<dyn DescriptionGenerator>,
    pub notifier: Arc<dyn Notifier>,
    pub artifacts: Arc<dyn ArtifactBuilder>,
}

impl Services {
    /// Build the real HTTP adapters.
    pub fn from_config(cfg: &Config) -> Result<Self, ServiceError> {
        let url = |service: &'static str, raw: &str| {
            reqwest::Url::parse(raw).map_err(|err| ServiceError::malformed(service, err.to_string()))
        };
        let sheets = SheetsClient::with_base_url(
            cfg.sheets.spreadsheet_id.clone(),
            cfg.sheets.access_token.clone(),
            url("sheets", &cfg.sheets.base_url)?,
        )?;
        let content = WordPressClient::new(
            url("content", &cfg.content.base_url)?,
            cfg.content.post_type.clone(),
            cfg.content.username.clone(),
            cfg.content.app_password.clone(),
        )?;
        let describer = OpenAiDescriber::new(
            url("describer", &cfg.describer.base_url)?,
            cfg.describer.api_key.clone(),
            cfg.describer.model.clone(),
            cfg.describer.max_words,
        )?;
        let notifier = SendGridNotifier::new(
            url("notifier", &cfg.notifier.base_url)?,
            cfg.notifier.api_key.clone(),
            cfg.notifier.sender_email.clone(),
            cfg.notifier.sender_name.clone(),
        )?;
        let artifacts = HttpArtifactBuilder::new(url("artifacts", &cfg.artifacts.endpoint)?)?;

        Ok(Self {
            sheet: AppraisalSheet::new(
                Arc::new(sheets),
                cfg.sheets.pending_sheet.clone(),
                cfg.sheets.completed_sheet.clone(),
            ),
            content: Arc::new(content),
            describer: Arc::new(describer),
            notifier: Arc::new(notifier),
            artifacts: Arc::new(artifacts),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub completed_template_id: String,
    pub update_template_id: String,
    pub update_delay: Duration,
    pub dashboard_url: String,
    pub step_deadline: Duration,
    pub move_completed: bool,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            completed_template_id: cfg.notifier.completed_template_id.clone(),
            update_template_id: cfg.notifier.update_template_id.clone(),
            update_delay: Duration::from_secs(cfg.notifier.update_delay_seconds),
            dashboard_url: cfg.notifier.dashboard_url.clone(),
            step_deadline: cfg.app.step_deadline(),
            move_completed: cfg.sheets.move_completed,
        }
    }
}

/// Input for one pipeline invocation. Absent value or description fall back
/// to what the record store already holds.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub record_id: u32,
    pub appraisal_value: Option<String>,
    pub description: Option<String>,
    /// Who triggered the run (`api`, `queue`, `cli`).
    pub actor: String,
}

impl PipelineRequest {
    pub fn new(record_id: u32, actor: impl Into<String>) -> Self {
        Self {
            record_id,
            appraisal_value: None,
            description: None,
            actor: actor.into(),
        }
    }

    pub fn with_value(mut self, value: impl Into<String>, description: impl Into<String>) -> Self {
        self.appraisal_value = Some(value.into()).filter(|v| !v.trim().is_empty());
        self.description = Some(description.into()).filter(|v| !v.trim().is_empty());
        self
    }
}

/// State accumulated across the steps of one invocation.
#[derive(Debug, Clone)]
pub(crate) struct RunContext {
    pub run_id: String,
    pub actor: String,
    pub record: AppraisalRecord,
    pub appraisal_type: AppraisalType,
}

impl RunContext {
    fn id(&self) -> u32 {
        self.record.id
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepLog {
    pub step: Step,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub record_id: u32,
    pub steps: Vec<StepLog>,
}

/// A run that stopped early. `trail` holds every step attempted, the failed
/// one last.
#[derive(Debug, Error)]
#[error("record {record_id} failed at {}: {source}", step_name(.step))]
pub struct PipelineFailure {
    pub run_id: Option<String>,
    pub record_id: u32,
    pub step: Option<Step>,
    #[source]
    pub source: PipelineError,
    pub trail: Vec<StepLog>,
}

fn step_name(step: &Option<Step>) -> &'static str {
    step.as_ref().map_or("setup", Step::as_str)
}

impl PipelineFailure {
    fn setup(run_id: Option<String>, record_id: u32, source: PipelineError) -> Self {
        Self {
            run_id,
            record_id,
            step: None,
            source,
            trail: Vec::new(),
        }
    }
}

/// What a step did when it did not fail.
#[derive(Debug)]
pub(crate) enum StepDone {
    Done(Option<String>),
    /// Done, and the success event is already in the step history.
    Journaled(Option<String>),
    Skipped(String),
}

#[derive(Clone)]
pub struct Engine {
    services: Services,
    pool: Pool,
    settings: PipelineSettings,
}

impl Engine {
    pub fn new(services: Services, pool: Pool, settings: PipelineSettings) -> Self {
        Self {
            services,
            pool,
            settings,
        }
    }

    pub fn from_config(cfg: &Config, pool: Pool) -> Result<Self, ServiceError> {
        Ok(Self::new(
            Services::from_config(cfg)?,
            pool,
            PipelineSettings::from_config(cfg),
        ))
    }

    pub fn sheet(&self) -> &AppraisalSheet {
        &self.services.sheet
    }

    pub fn content(&self) -> &Arc<dyn ContentService> {
        &self.services.content
    }

    pub fn describer(&self) -> &Arc<dyn DescriptionGenerator> {
        &self.services.describer
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.services.notifier
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Full run, `SET_VALUE` through `COMPLETE`.
    pub async fn process(&self, req: PipelineRequest) -> Result<RunReport, PipelineFailure> {
        self.process_from_step(req, Step::SetValue).await
    }

    /// Resume at `from`. Everything earlier steps would have produced is
    /// reloaded from the record store first.
    pub async fn process_from_step(
        &self,
        req: PipelineRequest,
        from: Step,
    ) -> Result<RunReport, PipelineFailure> {
        self.execute(req, from.from_here().collect()).await
    }

    /// Only `SET_VALUE`: record the appraiser's value and description.
    pub async fn set_value(&self, req: PipelineRequest) -> Result<RunReport, PipelineFailure> {
        self.execute(req, vec![Step::SetValue]).await
    }

    async fn execute(
        &self,
        req: PipelineRequest,
        steps: Vec<Step>,
    ) -> Result<RunReport, PipelineFailure> {
        let record_id = req.record_id;
        let first = steps.first().copied().unwrap_or(Step::SetValue);
        // Setup failures are recorded against the run as well.
        let run_id = db::create_run(&self.pool, record_id, &req.actor, first.as_str())
            .await
            .map_err(|err| PipelineFailure::setup(None, record_id, err.into()))?;
        let mut ctx = match self
            .prepare(&req, &run_id, steps.contains(&Step::SetValue))
            .await
        {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(record_id, %run_id, kind = err.kind(), %err, "pipeline run could not start");
                self.mark_failed(&run_id, None, &err).await;
                return Err(PipelineFailure::setup(Some(run_id), record_id, err));
            }
        };
        info!(record_id, run_id = %ctx.run_id, from = %first, actor = %req.actor, "pipeline run started");

        let mut trail = Vec::with_capacity(steps.len());
        for step in steps {
            let span = info_span!("pipeline_step", record_id, step = %step);
            let result = self.run_step(step, &mut ctx, &req.actor).instrument(span).await;
            match result {
                Ok(log) => trail.push(log),
                Err((log, err)) => {
                    trail.push(log);
                    error!(record_id, step = %step, kind = err.kind(), %err, "pipeline step failed");
                    self.mark_failed(&ctx.run_id, Some(step), &err).await;
                    return Err(PipelineFailure {
                        run_id: Some(ctx.run_id),
                        record_id,
                        step: Some(step),
                        source: err,
                        trail,
                    });
                }
            }
        }

        let completed = trail.last().is_some_and(|log| log.step == Step::Complete);
        if completed && self.settings.move_completed {
            // Relocation is bookkeeping; the record already reads Completed.
            if let Err(err) = self.relocate(record_id).await {
                warn!(record_id, %err, "failed to move record to completed sheet");
            }
        }

        db::finish_run(&self.pool, &ctx.run_id, RunState::Succeeded, None, None)
            .await
            .map_err(|err| PipelineFailure {
                run_id: Some(ctx.run_id.clone()),
                record_id,
                step: None,
                source: err.into(),
                trail: trail.clone(),
            })?;
        info!(record_id, run_id = %ctx.run_id, steps = trail.len(), "pipeline run finished");

        Ok(RunReport {
            run_id: ctx.run_id,
            record_id,
            steps: trail,
        })
    }

    /// Load the record and overlay the request's value and description.
    async fn prepare(
        &self,
        req: &PipelineRequest,
        run_id: &str,
        needs_value: bool,
    ) -> Result<RunContext, PipelineError> {
        let mut record = self.services.sheet.load(req.record_id).await?;
        if let Some(value) = &req.appraisal_value {
            record.set(Field::Value, value.trim());
        }
        if let Some(desc) = &req.description {
            record.set(Field::AppraiserDescription, desc.trim());
        }
        if needs_value {
            if record.value.is_empty() {
                return Err(PipelineError::validation("appraisalValue is required"));
            }
            if record.appraiser_description.is_empty() {
                return Err(PipelineError::validation("description is required"));
            }
        }
        let appraisal_type = AppraisalType::resolve(&record.appraisal_type);
        Ok(RunContext {
            run_id: run_id.to_string(),
            actor: req.actor.clone(),
            record,
            appraisal_type,
        })
    }

    async fn run_step(
        &self,
        step: Step,
        ctx: &mut RunContext,
        actor: &str,
    ) -> Result<StepLog, (StepLog, PipelineError)> {
        let started = Instant::now();
        self.journal(ctx, step, StepOutcome::Started, actor, None, None).await;
        info!("step started");

        let outcome = match tokio::time::timeout(self.settings.step_deadline, self.dispatch(step, ctx)).await {
            Ok(res) => res,
            Err(_) => Err(PipelineError::Timeout { step }),
        };
        // Durable checkpoint: the status cell names the last step that got through.
        let outcome = match outcome {
            Ok(done) => self
                .services
                .sheet
                .write(ctx.id(), Field::Status, step.status_label())
                .await
                .map(|_| {
                    ctx.record.set(Field::Status, step.status_label());
                    done
                })
                .map_err(PipelineError::from),
            Err(err) => Err(err),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(StepDone::Done(detail)) => {
                self.journal(ctx, step, StepOutcome::Succeeded, actor, detail.as_deref(), None)
                    .await;
                info!(elapsed_ms, "step succeeded");
                Ok(StepLog {
                    step,
                    outcome: StepOutcome::Succeeded,
                    detail,
                    elapsed_ms,
                })
            }
            Ok(StepDone::Journaled(detail)) => {
                info!(elapsed_ms, "step succeeded");
                Ok(StepLog {
                    step,
                    outcome: StepOutcome::Succeeded,
                    detail,
                    elapsed_ms,
                })
            }
            Ok(StepDone::Skipped(reason)) => {
                self.journal(ctx, step, StepOutcome::Skipped, actor, Some(&reason), None)
                    .await;
                info!(elapsed_ms, %reason, "step skipped");
                Ok(StepLog {
                    step,
                    outcome: StepOutcome::Skipped,
                    detail: Some(reason),
                    elapsed_ms,
                })
            }
            Err(err) => {
                let detail = err.to_string();
                self.journal(ctx, step, StepOutcome::Failed, actor, Some(&detail), None)
                    .await;
                Err((
                    StepLog {
                        step,
                        outcome: StepOutcome::Failed,
                        detail: Some(detail),
                        elapsed_ms,
                    },
                    err,
                ))
            }
        }
    }

    async fn dispatch(&self, step: Step, ctx: &mut RunContext) -> Result<StepDone, PipelineError> {
        match step {
            Step::SetValue => self.set_value_step(ctx).await,
            Step::MergeDescriptions => self.merge_descriptions(ctx).await,
            Step::GetType => self.get_type(ctx).await,
            Step::UpdateContent => self.update_content(ctx).await,
            Step::InsertTemplate => self.insert_template(ctx).await,
            Step::BuildArtifact => self.build_artifact(ctx).await,
            Step::NotifyCustomer => self.notify_customer(ctx).await,
            Step::Complete => self.complete(ctx).await,
        }
    }

    /// History writes never fail a step; the record store is the checkpoint.
    async fn journal(
        &self,
        ctx: &RunContext,
        step: Step,
        outcome: StepOutcome,
        actor: &str,
        detail: Option<&str>,
        fingerprint: Option<&str>,
    ) {
        let event = NewStepEvent {
            run_id: &ctx.run_id,
            record_id: ctx.id(),
            step: step.as_str(),
            outcome: outcome.as_str(),
            actor,
            detail,
            fingerprint,
        };
        if let Err(err) = db::append_step_event(&self.pool, &event).await {
            warn!(?err, step = %step, "failed to append step history");
        }
    }

    async fn mark_failed(&self, run_id: &str, step: Option<Step>, err: &PipelineError) {
        let failed_step = step.map(|s| s.as_str());
        if let Err(db_err) = db::finish_run(
            &self.pool,
            run_id,
            RunState::Failed,
            failed_step,
            Some(&err.to_string()),
        )
        .await
        {
            warn!(?db_err, "failed to mark run failed");
        }
    }

    async fn relocate(&self, record_id: u32) -> Result<(), PipelineError> {
        let record = self.services.sheet.load(record_id).await?;
        self.services.sheet.move_to_completed(&record).await?;
        Ok(())
    }
}

