mod ext;

use crate::observability::metrics::HTTP_REQUEST_DURATION_SECONDS;
use crate::prelude::*;
use crate::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use task_local_extensions::Extensions;

pub(crate) mod prelude {
    pub(crate) use super::ext::{RequestBuilderExt as _, ResponseExt as _};
}

pub type Client = reqwest_middleware::ClientWithMiddleware;

pub(crate) struct ClientOptions {
    pub(crate) timeout: Duration,

    /// Some providers serve their APIs with certificates signed by a CA
    /// that is not in the default trust store.
    pub(crate) accept_invalid_certs: bool,
}

pub(crate) fn create_client(opts: ClientOptions) -> Result<Client> {
    let client = reqwest::Client::builder()
        .timeout(opts.timeout)
        .danger_accept_invalid_certs(opts.accept_invalid_certs)
        .user_agent(concat!("tg-relay/", env!("CARGO_PKG_VERSION")))
        .build()
        .fatal_ctx(|| "Failed to build the HTTP client")?;

    // No retry middleware here. Retries are specific to each API (e.g. the
    // LLM provider wants a fixed backoff on 429 and a token refresh on 401).
    let client = reqwest_middleware::ClientBuilder::new(client)
        .with(ObservingMiddleware)
        .build();

    Ok(client)
}

struct ObservingMiddleware;

#[async_trait]
impl reqwest_middleware::Middleware for ObservingMiddleware {
    async fn handle(
        &self,
        request: reqwest::Request,
        extensions: &mut Extensions,
        next: reqwest_middleware::Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        let span = info_span!(
            "request",
            version = ?request.version(),
            method = %request.method(),
            url = %request.url(),
        );

        async {
            let (result, duration) = measure_request(request, extensions, next).await;

            let duration = tracing_duration(duration);

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
        .instrument(span)
        .await
    }
}

async fn measure_request(
    request: reqwest::Request,
    extensions: &mut Extensions,
    next: reqwest_middleware::Next<'_>,
) -> (reqwest_middleware::Result<reqwest::Response>, Duration) {
    let method = request.method().to_string();
    let host = request.url().host_str().unwrap_or("{unknown}").to_owned();

    let start = Instant::now();
    let result = next.run(request, extensions).await;
    let elapsed = start.elapsed();

    let status = match &result {
        Ok(response) => response.status().as_u16().to_string(),
        Err(_) => "{fatal}".to_owned(),
    };

    metrics::histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method,
        "host" => host,
        "status" => status,
    )
    .record(elapsed);

    (result, elapsed)
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
