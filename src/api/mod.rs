//! HTTP surface. Handlers are thin: they parse, call the engine or the
//! queue, and shape `{ success, message?, ...data }` responses.
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::PipelineError;
use crate::pipeline::{Engine, PipelineFailure};
use crate::queue::Queue;

mod handlers;

pub const SHARED_SECRET_HEADER: &str = "x-shared-secret";

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub queue: Queue,
    pub topic: String,
    pub shared_secret: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/appraisals", get(handlers::list_appraisals))
        .route("/appraisals/process-worker", post(handlers::process_worker))
        .route("/appraisals/:id/list", get(handlers::get_appraisal))
        .route("/appraisals/:id/list-edit", get(handlers::get_appraisal_for_edit))
        .route("/appraisals/:id/set-value", post(handlers::set_value))
        .route("/appraisals/:id/complete-process", post(handlers::complete_process))
        .route("/appraisals/:id/process-from-step", post(handlers::process_from_step))
        .route("/appraisals/:id/status", get(handlers::status))
        .route("/update-pending-appraisal", post(handlers::update_pending))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// `200 { success: true, ...data }`
pub(crate) fn ok(data: Value) -> Response {
    with_status(StatusCode::OK, data)
}

pub(crate) fn with_status(status: StatusCode, data: Value) -> Response {
    let mut body = json!({ "success": true });
    if let (Some(out), Value::Object(extra)) = (body.as_object_mut(), data) {
        out.extend(extra);
    }
    (status, Json(body)).into_response()
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("missing or invalid shared secret")]
    Unauthorized,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Run(#[from] PipelineFailure),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "message": msg }),
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "message": self.to_string() }),
            ),
            ApiError::Pipeline(err) => (
                status_of(err),
                json!({ "success": false, "message": err.to_string(), "kind": err.kind() }),
            ),
            ApiError::Run(failure) => (
                status_of(&failure.source),
                json!({
                    "success": false,
                    "message": failure.to_string(),
                    "kind": failure.source.kind(),
                    "runId": failure.run_id,
                    "failedStep": failure.step,
                    "steps": failure.trail,
                }),
            ),
            ApiError::Internal(err) => {
                error!(?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "success": false, "message": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn status_of(err: &PipelineError) -> StatusCode {
    StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
