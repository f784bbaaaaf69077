//! Stage handler backed by a remote HTTP endpoint.
//!
//! The item payload is POSTed as JSON. A `2xx` JSON object becomes the new
//! payload; its `Status` field is reported as the stage status and a
//! `NextStage` field as the next-stage hint. `429` maps to the rate-limit kind
//! with any `Retry-After` header as backoff hint. Other failures use the
//! `errorType`/`errorMessage` fields of the body when present and the
//! configured kind otherwise.

use super::StageHandler;
use crate::core::{ClassifiedError, ErrorKind, StageName, StageResult, WorkItem};
use crate::errors::FhirflowError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Calls a remote endpoint for one stage.
#[derive(Debug, Clone)]
pub struct HttpStage {
    name: String,
    url: String,
    client: Client,
    error_kind: ErrorKind,
    headers: Vec<(String, String)>,
}

impl HttpStage {
    /// Creates a handler posting to `url`; unclassified failures use `error_kind`.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        error_kind: ErrorKind,
    ) -> Result<Self, FhirflowError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| FhirflowError::internal(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
            error_kind,
            headers: Vec::new(),
        })
    }

    /// Adds a header sent with every request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn classify_body(&self, status: StatusCode, body: &str) -> ClassifiedError {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let kind = parsed
            .as_ref()
            .and_then(|v| v.get("errorType"))
            .and_then(Value::as_str)
            .map_or_else(|| self.error_kind.clone(), ErrorKind::from_name);
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("errorMessage"))
            .and_then(Value::as_str)
            .map_or_else(|| format!("HTTP {}: {body}", status.as_u16()), str::to_string);

        if status.is_server_error() {
            ClassifiedError::retryable(kind, message)
        } else {
            ClassifiedError::new(kind, message)
        }
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl StageHandler for HttpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, item: &WorkItem) -> Result<StageResult, FhirflowError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("x-fhirflow-item-id", &item.id)
            .header("x-fhirflow-batch-id", &item.batch_id)
            .json(&item.payload);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    item_id = %item.id,
                    url = %self.url,
                    error = %err,
                    "Stage request failed"
                );
                return Ok(ClassifiedError::retryable(
                    self.error_kind.clone(),
                    format!("request to {} failed: {err}", self.url),
                )
                .into());
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let hint = retry_after(response.headers());
            let mut err = ClassifiedError::rate_limited(format!("{} is rate limiting", self.url));
            if let Some(delay) = hint {
                err = err.with_backoff_hint(delay);
            }
            return Ok(err.into());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(
                    item_id = %item.id,
                    url = %self.url,
                    status = status.as_u16(),
                    error = %err,
                    "Stage response body unreadable"
                );
                return Ok(ClassifiedError::retryable(
                    self.error_kind.clone(),
                    format!("reading response from {} failed: {err}", self.url),
                )
                .into());
            }
        };
        if !status.is_success() {
            return Ok(self.classify_body(status, &body).into());
        }

        let payload = match serde_json::from_str::<Value>(&body) {
            Ok(payload @ Value::Object(_)) => payload,
            Ok(_) | Err(_) => {
                return Ok(StageResult::failed(
                    self.error_kind.clone(),
                    format!("{} returned a non-object body", self.url),
                ))
            }
        };

        let reported = payload.get("Status").and_then(Value::as_str).map(str::to_string);
        let hint = payload
            .get("NextStage")
            .and_then(Value::as_str)
            .and_then(StageName::parse);

        let mut result = match reported {
            Some(status) => StageResult::success_with_status(payload, status),
            None => StageResult::success(payload),
        };
        if let Some(stage) = hint {
            result = result.with_next_hint(stage);
        }
        Ok(result)
    }
}
