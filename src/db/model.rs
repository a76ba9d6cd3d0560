//! Row types used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in `queue` and `pipeline`.

use serde::Serialize;

/// A leased queue message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: String,
    pub topic: String,
    pub ordering_key: Option<String>,
    pub payload: String,
    pub attempt: i64,
}

/// One pipeline invocation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct RunRow {
    pub run_id: String,
    pub record_id: i64,
    pub actor: String,
    pub start_step: String,
    pub state: String,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// One entry of the append-only step log.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub run_id: String,
    pub record_id: i64,
    pub step: String,
    pub outcome: String,
    pub actor: String,
    pub detail: Option<String>,
    pub fingerprint: Option<String>,
    pub created_at: String,
}

/// Insert shape for [`StepEvent`].
#[derive(Debug, Clone)]
pub struct NewStepEvent<'a> {
    pub run_id: &'a str,
    pub record_id: u32,
    pub step: &'a str,
    pub outcome: &'a str,
    pub actor: &'a str,
    pub detail: Option<&'a str>,
    pub fingerprint: Option<&'a str>,
}
