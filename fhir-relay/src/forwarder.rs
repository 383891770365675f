use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use fhir_common::retry::RetryPolicy;
use fhir_common::validator::ResponseValidator;
use reqwest::{header, StatusCode};
use tracing::{debug, error, warn};
use url::Url;

use crate::config::Secret;
use crate::error::ForwarderError;

const FHIR_JSON: &str = "application/fhir+json";

/// Posts bundles to the FHIR server.
///
/// A call succeeds only when the server accepted the bundle at the transport level and
/// every entry of a returned response bundle carries a 2xx status. Transport failures
/// that may go away on their own (timeouts, refused or reset connections) are retried
/// according to the `RetryPolicy`; responses are never retried.
pub struct Forwarder {
    client: reqwest::Client,
    url: Url,
    retry_policy: RetryPolicy,
    validator: ResponseValidator,
}

impl Forwarder {
    pub fn new(
        url: Url,
        credentials: Option<(String, Secret)>,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ForwarderError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static(FHIR_JSON));
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(FHIR_JSON));

        if let Some((user, password)) = credentials {
            let token = STANDARD.encode(format!("{}:{}", user, password.expose()));
            let mut value = header::HeaderValue::from_str(&format!("Basic {}", token))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("FHIR Relay")
            .timeout(retry_policy.per_attempt_timeout())
            .build()?;

        Ok(Self {
            client,
            url,
            retry_policy,
            validator: ResponseValidator,
        })
    }

    /// Forward a bundle, returning whether the server accepted it. Fails closed: any
    /// error that survives the retries is a failure.
    pub async fn send(&self, payload: &[u8]) -> bool {
        let start = Instant::now();

        let success = match self.post_with_retries(payload).await {
            Ok((status, body)) => {
                let body = (!body.is_empty()).then_some(body);
                let success = self.validator.is_success(status.as_u16(), body.as_deref());
                let text = body
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();

                if success {
                    debug!(status = status.as_u16(), body = %text, "bundle forwarded");
                } else {
                    error!(status = status.as_u16(), body = %text, "FHIR server rejected bundle");
                }
                metrics::counter!(
                    "fhir_forward_requests_total",
                    "outcome" => if success { "success" } else { "rejected" }
                )
                .increment(1);
                success
            }
            Err(error) => {
                error!(%error, url = %self.url, "failed to forward bundle");
                metrics::counter!("fhir_forward_requests_total", "outcome" => "error").increment(1);
                false
            }
        };

        metrics::histogram!("fhir_forward_duration_seconds").record(start.elapsed().as_secs_f64());
        success
    }

    async fn post_with_retries(&self, payload: &[u8]) -> Result<(StatusCode, Bytes), reqwest::Error> {
        let mut attempt = 1;

        loop {
            match self.post(payload).await {
                Ok(response) => return Ok(response),
                Err(error) if is_transient(&error) && self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        ?backoff,
                        %error,
                        "transient error forwarding bundle, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn post(&self, payload: &[u8]) -> Result<(StatusCode, Bytes), reqwest::Error> {
        let response = self
            .client
            .post(self.url.clone())
            .body(payload.to_vec())
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        Ok((status, body))
    }
}

/// Errors raised while the request was on the wire. Building the request, redirect
/// loops and decoding problems will fail the same way on every attempt.
fn is_transient(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
