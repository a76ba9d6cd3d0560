//! Queue consumer that turns `COMPLETE_APPRAISAL` messages into pipeline runs.
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::model::{CompleteAppraisal, Step};
use crate::pipeline::{Engine, PipelineFailure, PipelineRequest};
use crate::queue::{Disposition, MessageHandler};

pub struct PipelineWorker {
    engine: Engine,
}

impl PipelineWorker {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

/// Retryable failures go back on the queue; bad data is parked for a human.
pub fn disposition_for(failure: &PipelineFailure) -> Disposition {
    let reason = failure.to_string();
    if failure.source.is_retryable() {
        Disposition::Nack(reason)
    } else {
        Disposition::DeadLetter(reason)
    }
}

#[async_trait]
impl MessageHandler for PipelineWorker {
    #[instrument(skip(self, payload))]
    async fn handle(&self, message_id: &str, payload: &Value) -> Disposition {
        let task = match CompleteAppraisal::from_message(payload) {
            Ok(task) => task,
            Err(reason) => return Disposition::DeadLetter(reason),
        };
        let record_id = match task.record_id() {
            Ok(id) => id,
            Err(reason) => return Disposition::DeadLetter(reason),
        };

        let req = PipelineRequest::new(record_id, "queue")
            .with_value(task.appraisal_value.clone(), task.description.clone());
        let from = task.from_step.unwrap_or(Step::SetValue);
        match self.engine.process_from_step(req, from).await {
            Ok(report) => {
                info!(record_id, run_id = %report.run_id, "task completed");
                Disposition::Ack
            }
            Err(failure) => {
                warn!(record_id, error = %failure, "task failed");
                disposition_for(&failure)
            }
        }
    }
}
