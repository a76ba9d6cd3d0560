use crate::model::Step;
use thiserror::Error;

/// Failure talking to one of the external services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} request failed: {message}")]
    Transport {
        service: &'static str,
        message: String,
    },
    #[error("{service} timed out")]
    Timeout { service: &'static str },
    #[error("{service} error {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} returned a malformed response: {message}")]
    Malformed {
        service: &'static str,
        message: String,
    },
    #[error("{service} rejected input: {message}")]
    InvalidInput {
        service: &'static str,
        message: String,
    },
}

impl ServiceError {
    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout { service }
        } else {
            ServiceError::Transport {
                service,
                message: err.to_string(),
            }
        }
    }

    pub fn malformed(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Malformed {
            service,
            message: message.into(),
        }
    }

    /// Transport failures, timeouts, 429 and 5xx may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Transport { .. } | ServiceError::Timeout { .. } => true,
            ServiceError::Status { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Malformed { .. } | ServiceError::InvalidInput { .. } => false,
        }
    }
}

/// Why a pipeline step (or a request feeding the pipeline) failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or malformed caller input.
    #[error("validation failed: {0}")]
    Validation(String),
    /// An external service failed.
    #[error(transparent)]
    Dependency(ServiceError),
    /// Stored data cannot be processed; redelivery would hit the same bad data.
    #[error("data integrity: {0}")]
    DataIntegrity(String),
    #[error("step {step} exceeded its deadline")]
    Timeout { step: Step },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ServiceError> for PipelineError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidInput { service, message } => {
                PipelineError::DataIntegrity(format!("{service}: {message}"))
            }
            other => PipelineError::Dependency(other),
        }
    }
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        PipelineError::DataIntegrity(msg.into())
    }

    /// Whether queue redelivery can be expected to help.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Validation(_) | PipelineError::DataIntegrity(_) => false,
            PipelineError::Dependency(_) | PipelineError::Timeout { .. } => true,
            PipelineError::Internal(_) => true,
        }
    }

    /// HTTP status used when the error is reported to an API caller.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 400,
            PipelineError::DataIntegrity(_) => 422,
            PipelineError::Dependency(_) => 502,
            PipelineError::Timeout { .. } => 504,
            PipelineError::Internal(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Dependency(_) => "dependency",
            PipelineError::DataIntegrity(_) => "data_integrity",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Internal(_) => "internal",
        }
    }
}
