//! Shared request execution for the external-service adapters.
use reqwest::{Client, Request};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::retry::RetryPolicy;

const USER_AGENT: &str = "appraisal-pipeline/0.1";

/// Build a client with an explicit request timeout.
pub fn client(service: &'static str, timeout: Duration) -> Result<Client, ServiceError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|err| ServiceError::from_reqwest(service, err))
}

/// Execute a freshly built request under `policy`, returning the body of the
/// first 2xx response. Non-2xx responses surface with their body attached.
pub async fn send<B>(
    http: &Client,
    policy: &RetryPolicy,
    service: &'static str,
    build: B,
) -> Result<String, ServiceError>
where
    B: Fn() -> Result<Request, ServiceError>,
{
    let build = &build;
    policy
        .run(service, move || async move {
            let request = build()?;
            debug!(service, method = %request.method(), url = %request.url(), "sending request");
            let res = http
                .execute(request)
                .await
                .map_err(|err| ServiceError::from_reqwest(service, err))?;

            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                warn!(service, status = status.as_u16(), %body, "service returned error");
                return Err(ServiceError::Status {
                    service,
                    status: status.as_u16(),
                    body,
                });
            }
            res.text()
                .await
                .map_err(|err| ServiceError::from_reqwest(service, err))
        })
        .await
}

/// Decode a JSON body, mapping failures to `ServiceError::Malformed`.
pub fn decode<T: serde::de::DeserializeOwned>(
    service: &'static str,
    body: &str,
) -> Result<T, ServiceError> {
    serde_json::from_str(body).map_err(|err| ServiceError::malformed(service, err.to_string()))
}
