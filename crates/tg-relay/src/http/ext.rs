use super::HttpClientError;
use crate::prelude::*;
use crate::{err, err_ctx, Result};
use async_trait::async_trait;
use easy_ext::ext;
use reqwest::Response;
use reqwest_middleware::RequestBuilder;
use serde::de::DeserializeOwned;

/// Longer error bodies are cut, they are mostly HTML pages of proxies
const MAX_ERROR_BODY_CHARS: usize = 2000;

#[ext(RequestBuilderExt)]
#[async_trait]
pub(crate) impl RequestBuilder {
    /// Sends the request and deserializes the JSON response. Responses with
    /// 4xx and 5xx status codes are turned into errors.
    async fn read_json<Res: DeserializeOwned>(self) -> Result<Res> {
        let response = self
            .send()
            .await
            .map_err(err_ctx!(HttpClientError::Request))?;

        let status = response.status();

        if status.is_client_error() || status.is_server_error() {
            let body = response.error_body().await;
            return Err(err!(HttpClientError::BadResponseStatusCode { status, body }));
        }

        response.read_json().await
    }
}

#[ext(ResponseExt)]
#[async_trait]
pub(crate) impl Response {
    async fn read_json<Res: DeserializeOwned>(self) -> Result<Res> {
        let bytes = self
            .bytes()
            .await
            .map_err(err_ctx!(HttpClientError::ReadPayload))?;

        serde_json::from_slice(&bytes).map_err(|source| {
            let body = String::from_utf8_lossy(&bytes);
            warn!(body = %truncate(&body), "Bad JSON response");
            err!(HttpClientError::UnexpectedResponseJsonShape { source })
        })
    }

    /// Body of the failed response for diagnostics. Never fails.
    async fn error_body(self) -> String {
        match self.text().await {
            Ok(body) => truncate(&body).to_owned(),
            Err(err) => format!(
                "Could not collect the error response body text: {}",
                err.display_chain()
            ),
        }
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_bodies_are_truncated() {
        let body = "ю".repeat(MAX_ERROR_BODY_CHARS + 10);
        assert_eq!(truncate(&body).chars().count(), MAX_ERROR_BODY_CHARS);
        assert_eq!(truncate("short"), "short");
    }
}
