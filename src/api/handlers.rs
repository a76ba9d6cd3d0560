use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::{ok, with_status, ApiError, AppState, SHARED_SECRET_HEADER};
use crate::db;
use crate::intake::IntakeRequest;
use crate::model::{CompleteAppraisal, Step};
use crate::pipeline::PipelineRequest;
use crate::queue;

type ApiResult = Result<Response, ApiError>;

/// `appraisalValue` and `description` as callers send them. The value may
/// be a JSON number or a string.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueBody {
    #[serde(default)]
    appraisal_value: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

impl ValueBody {
    fn value_text(&self) -> Option<String> {
        match self.appraisal_value.as_ref()? {
            Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn description_text(&self) -> Option<String> {
        self.description
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Both fields present, or a 400 naming the first missing one.
    fn require(&self) -> Result<(String, String), ApiError> {
        let value = self
            .value_text()
            .ok_or_else(|| ApiError::BadRequest("appraisalValue is required".into()))?;
        let description = self
            .description_text()
            .ok_or_else(|| ApiError::BadRequest("description is required".into()))?;
        Ok((value, description))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromStepBody {
    step: String,
    #[serde(flatten)]
    values: ValueBody,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rej| ApiError::BadRequest(rej.body_text()))
}

fn record_id(raw: &str) -> Result<u32, ApiError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| ApiError::BadRequest(format!("invalid appraisal id {raw:?}")))
}

#[instrument(skip_all)]
pub async fn list_appraisals(State(state): State<AppState>) -> ApiResult {
    let records = state
        .engine
        .sheet()
        .list_pending()
        .await
        .map_err(crate::error::PipelineError::from)?;
    Ok(ok(json!({ "count": records.len(), "appraisals": records })))
}

/// Row plus a summary of the content post, when one can be reached.
#[instrument(skip_all)]
pub async fn get_appraisal(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = record_id(&id)?;
    let record = state.engine.sheet().load(id).await?;
    let post = match record.post_id() {
        Ok(post_id) => match state.engine.content().get_post(post_id).await {
            Ok(post) => json!({
                "id": post.id,
                "title": post.title,
                "link": post.link,
                "acf": post.acf,
            }),
            Err(err) => {
                warn!(id, %err, "content post unavailable");
                Value::Null
            }
        },
        Err(_) => Value::Null,
    };
    Ok(ok(json!({ "appraisal": record, "post": post })))
}

#[instrument(skip_all)]
pub async fn get_appraisal_for_edit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = record_id(&id)?;
    let r = state.engine.sheet().load(id).await?;
    Ok(ok(json!({
        "appraisal": {
            "id": r.id,
            "appraisalType": r.appraisal_type,
            "customerEmail": r.customer_email,
            "customerName": r.customer_name,
            "status": r.status,
            "value": r.value,
            "appraiserDescription": r.appraiser_description,
            "aiDescription": r.ai_description,
            "customerDescription": r.customer_description,
            "images": r.images(),
        }
    })))
}

#[instrument(skip_all)]
pub async fn set_value(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ValueBody>, JsonRejection>,
) -> ApiResult {
    let id = record_id(&id)?;
    let (value, description) = body(payload)?.require()?;
    let req = PipelineRequest::new(id, "api").with_value(value, description);
    let report = state.engine.set_value(req).await?;
    Ok(ok(json!({
        "message": "Appraisal value set",
        "runId": report.run_id,
    })))
}

/// Queue a full run; the caller polls `statusUrl` for the outcome.
#[instrument(skip_all)]
pub async fn complete_process(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ValueBody>, JsonRejection>,
) -> ApiResult {
    let id = record_id(&id)?;
    let (value, description) = body(payload)?.require()?;
    let task = CompleteAppraisal {
        id: id.to_string(),
        appraisal_value: value,
        description,
        from_step: None,
    };
    let message_id = state
        .queue
        .publish_ordered(&state.topic, &task.id, &task.to_message())
        .await?;
    info!(id, %message_id, "pipeline task queued");
    Ok(with_status(
        StatusCode::ACCEPTED,
        json!({
            "message": "Appraisal processing started",
            "messageId": message_id,
            "statusUrl": format!("/appraisals/{id}/status"),
        }),
    ))
}

/// Synchronous run for an externally delivered task message.
#[instrument(skip_all)]
pub async fn process_worker(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let message = body(payload)?;
    let task = CompleteAppraisal::from_message(&message).map_err(ApiError::BadRequest)?;
    let id = task.record_id().map_err(ApiError::BadRequest)?;
    let req = PipelineRequest::new(id, "worker")
        .with_value(task.appraisal_value.clone(), task.description.clone());
    let report = state
        .engine
        .process_from_step(req, task.from_step.unwrap_or(Step::SetValue))
        .await?;
    Ok(ok(json!({
        "message": "Appraisal processed",
        "run": report,
    })))
}

#[instrument(skip_all)]
pub async fn process_from_step(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<FromStepBody>, JsonRejection>,
) -> ApiResult {
    let id = record_id(&id)?;
    let body = body(payload)?;
    let step = Step::parse_step(&body.step)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown step {:?}", body.step)))?;
    let mut req = PipelineRequest::new(id, "api");
    req.appraisal_value = body.values.value_text();
    req.description = body.values.description_text();
    let report = state.engine.process_from_step(req, step).await?;
    Ok(ok(json!({
        "message": format!("Processed from {step}"),
        "run": report,
    })))
}

#[instrument(skip_all)]
pub async fn status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = record_id(&id)?;
    let pool = state.engine.pool();
    let run = db::latest_run(pool, id).await?;
    let history = match &run {
        Some(run) => db::list_step_history(pool, id, Some(run.run_id.as_str())).await?,
        None => Vec::new(),
    };
    let key = id.to_string();
    let queued = queue::pending_for(&state.queue, &state.topic, &key).await?;
    let dead_letters: Vec<Value> = queue::dead_letters_for(&state.queue, &state.topic, &key)
        .await?
        .into_iter()
        .map(|(message_id, attempts, error)| {
            json!({ "messageId": message_id, "attempts": attempts, "error": error })
        })
        .collect();
    Ok(ok(json!({
        "appraisalId": id,
        "run": run,
        "history": history,
        "queued": queued,
        "deadLetters": dead_letters,
    })))
}

/// Intake webhook; requires the shared secret header.
#[instrument(skip_all)]
pub async fn update_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<IntakeRequest>, JsonRejection>,
) -> ApiResult {
    let presented = headers
        .get(SHARED_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.shared_secret.is_empty() || presented != state.shared_secret {
        return Err(ApiError::Unauthorized);
    }
    let req = body(payload)?;
    let outcome = state.engine.ingest(&req).await?;
    Ok(ok(json!({
        "message": "Pending appraisal updated",
        "recordId": outcome.record_id,
        "aiDescription": outcome.ai_description,
    })))
}
