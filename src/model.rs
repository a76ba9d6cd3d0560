use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordered pipeline steps. Declaration order is execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Step {
    SetValue,
    MergeDescriptions,
    GetType,
    UpdateContent,
    InsertTemplate,
    BuildArtifact,
    NotifyCustomer,
    Complete,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::SetValue,
        Step::MergeDescriptions,
        Step::GetType,
        Step::UpdateContent,
        Step::InsertTemplate,
        Step::BuildArtifact,
        Step::NotifyCustomer,
        Step::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::SetValue => "SET_VALUE",
            Step::MergeDescriptions => "MERGE_DESCRIPTIONS",
            Step::GetType => "GET_TYPE",
            Step::UpdateContent => "UPDATE_CONTENT",
            Step::InsertTemplate => "INSERT_TEMPLATE",
            Step::BuildArtifact => "BUILD_ARTIFACT",
            Step::NotifyCustomer => "NOTIFY_CUSTOMER",
            Step::Complete => "COMPLETE",
        }
    }

    pub fn parse_step(s: &str) -> Option<Step> {
        let wanted = s.trim();
        Step::ALL
            .into_iter()
            .find(|step| step.as_str().eq_ignore_ascii_case(wanted))
    }

    /// Label written into the record's `status` cell once the step succeeds.
    pub fn status_label(&self) -> &'static str {
        match self {
            Step::SetValue => "Value Set",
            Step::MergeDescriptions => "Descriptions Merged",
            Step::GetType => "Type Resolved",
            Step::UpdateContent => "Content Updated",
            Step::InsertTemplate => "Template Inserted",
            Step::BuildArtifact => "Artifacts Built",
            Step::NotifyCustomer => "Customer Notified",
            Step::Complete => "Completed",
        }
    }

    /// This step and every step after it, in execution order.
    pub fn from_here(self) -> impl Iterator<Item = Step> {
        Step::ALL.into_iter().filter(move |s| *s >= self)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Started,
    Succeeded,
    Skipped,
    Failed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Started => "started",
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Skipped => "skipped",
            StepOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

/// Appraisal product types. Anything unrecognised resolves to `RegularArt`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AppraisalType {
    #[default]
    RegularArt,
    PermanentArt,
    FastTrack,
}

impl AppraisalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppraisalType::RegularArt => "RegularArt",
            AppraisalType::PermanentArt => "PermanentArt",
            AppraisalType::FastTrack => "FastTrack",
        }
    }

    pub fn parse_type(s: &str) -> Option<AppraisalType> {
        let wanted = s.trim();
        [
            AppraisalType::RegularArt,
            AppraisalType::PermanentArt,
            AppraisalType::FastTrack,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(wanted))
    }

    /// Permissive resolution: blank or unknown input yields the default.
    pub fn resolve(s: &str) -> AppraisalType {
        Self::parse_type(s).unwrap_or_default()
    }
}

pub const COMPLETE_APPRAISAL: &str = "COMPLETE_APPRAISAL";

/// Payload of a "run the pipeline for record X" message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompleteAppraisal {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "appraisalValue", deserialize_with = "string_or_number")]
    pub appraisal_value: String,
    #[serde(default)]
    pub description: String,
    /// Resume point for manual reprocessing. Absent means a full run.
    #[serde(rename = "fromStep", default, skip_serializing_if = "Option::is_none")]
    pub from_step: Option<Step>,
}

/// Queue message as written by producers. Older producers sent the flat
/// shape; newer ones wrap it in a typed envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireTask {
    Envelope {
        #[serde(rename = "type")]
        kind: String,
        data: CompleteAppraisal,
    },
    Flat(CompleteAppraisal),
}

#[derive(Debug, Clone, Serialize)]
struct EnvelopeOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a CompleteAppraisal,
}

impl CompleteAppraisal {
    /// Parse either message shape. Envelopes with another `type` are rejected.
    pub fn from_message(payload: &Value) -> Result<Self, String> {
        let wire: WireTask = serde_json::from_value(payload.clone())
            .map_err(|err| format!("unrecognised task message: {err}"))?;
        match wire {
            WireTask::Envelope { kind, data } if kind == COMPLETE_APPRAISAL => Ok(data),
            WireTask::Envelope { kind, .. } => Err(format!("unsupported task type {kind}")),
            WireTask::Flat(data) => Ok(data),
        }
    }

    /// Producers always emit the envelope shape.
    pub fn to_message(&self) -> Value {
        serde_json::to_value(EnvelopeOut {
            kind: COMPLETE_APPRAISAL,
            data: self,
        })
        .unwrap_or(Value::Null)
    }

    pub fn record_id(&self) -> Result<u32, String> {
        self.id
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("invalid record id {:?}", self.id))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
