mod basic_ext;
mod json_ext;

use crate::observability::metrics;
use crate::prelude::*;
use async_trait::async_trait;
use reqwest_middleware::RequestBuilder;
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::RetryTransientMiddleware;
use std::time::{Duration, Instant};

pub(crate) mod prelude {
    pub(crate) use super::basic_ext::RequestBuilderBasicExt as _;
    pub(crate) use super::json_ext::RequestBuilderJsonExt as _;
}

pub type Client = reqwest_middleware::ClientWithMiddleware;

pub(crate) fn default_retry_policy() -> ExponentialBackoff {
    // Retry with exponentially increasing intervals between attempts.
    ExponentialBackoff::builder()
        .backoff_exponent(2)
        .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
        .build_with_max_retries(3)
}

pub(crate) fn create_client() -> Client {
    reqwest_middleware::ClientBuilder::new(teloxide::net::client_from_env())
        .with(OutermostObservingMiddleware)
        .with(RetryTransientMiddleware::new_with_policy(
            default_retry_policy(),
        ))
        .with(InnermostObservingMiddleware)
        .with_init(|request_builder: RequestBuilder| {
            request_builder.header(
                "User-Agent",
                concat!("AutofarmTelegramBot/", env!("CARGO_PKG_VERSION")),
            )
        })
        .build()
}

struct OutermostObservingMiddleware;

#[async_trait]
impl reqwest_middleware::Middleware for OutermostObservingMiddleware {
    async fn handle(
        &self,
        request: reqwest::Request,
        extensions: &mut task_local_extensions::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let span = info_span!(
            "request",
            method = %request.method(),
            url = %request.url(),
        );
        next.run(request, extensions).instrument(span).await
    }
}

struct InnermostObservingMiddleware;

#[async_trait]
impl reqwest_middleware::Middleware for InnermostObservingMiddleware {
    async fn handle(
        &self,
        request: reqwest::Request,
        extensions: &mut task_local_extensions::Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let method = request.method().to_string();
        let host = request.url().host_str().unwrap_or("{unknown}").to_owned();

        let start = Instant::now();
        let result = next.run(request, extensions).await;
        let elapsed = start.elapsed();

        let status = match &result {
            Ok(response) => response.status().to_string(),
            Err(_) => "{fatal}".to_owned(),
        };

        metrics::http_request_duration_seconds(method, host, status).record(elapsed.as_secs_f64());

        let duration = tracing_duration(elapsed);

        let response = match &result {
            Ok(response) => response,
            Err(err) => {
                error!(duration, err = tracing_err(err), "Network request failed");
                return result;
            }
        };

        let status = response.status();

        let Err(err) = response.error_for_status_ref() else {
            debug!(duration, %status, "Network request succeeded");
            return result;
        };

        warn!(
            err = tracing_err(&err),
            duration,
            %status,
            "Network request failed (error status)"
        );

        result
    }
}

/// Errors at the layer of the HTTP API
#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpClientError {
    #[error("HTTP request failed")]
    Request { source: reqwest_middleware::Error },

    #[error("Failed to read HTTP response")]
    ReadPayload { source: reqwest::Error },

    #[error("HTTP request has failed (HTTP status code: {status}):\n{body}")]
    BadResponseStatusCode {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Received an unexpected response JSON object")]
    UnexpectedResponseJsonShape { source: serde_json::Error },
}
