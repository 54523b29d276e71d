//! Client of the chat-completion LLM provider (GigaChat-compatible API)

mod client;
mod model;
mod prompts;
mod token;

use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::time::Duration;

pub(crate) use client::LlmClient;

#[cfg(test)]
pub(crate) use client::tests::{completion_body, test_config, token_body};

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    /// Base64-encoded `client_id:client_secret` pair sent in the `Basic` auth header
    pub(crate) auth_key: String,

    #[serde(default = "default_scope")]
    pub(crate) scope: String,

    #[serde(default = "default_oauth_url")]
    pub(crate) oauth_url: url::Url,

    /// Base URL of the API, `/chat/completions` is appended to it
    #[serde(default = "default_api_url")]
    pub(crate) api_url: url::Url,

    #[serde(default = "default_model")]
    pub(crate) model: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_request_timeout", rename = "request_timeout_secs")]
    pub(crate) request_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_rate_limit_backoff", rename = "rate_limit_backoff_secs")]
    pub(crate) rate_limit_backoff: Duration,

    #[serde(default = "default_true")]
    pub(crate) cache_responses: bool,

    #[serde(default = "default_true")]
    pub(crate) accept_invalid_certs: bool,
}

fn default_scope() -> String {
    "GIGACHAT_API_PERS".to_owned()
}

fn default_oauth_url() -> url::Url {
    static_url("https://ngw.devices.sberbank.ru:9443/api/v2/oauth")
}

fn default_api_url() -> url::Url {
    static_url("https://gigachat.devices.sberbank.ru/api/v1")
}

fn static_url(url: &str) -> url::Url {
    url.parse()
        .unwrap_or_else(|err| panic!("BUG: invalid static URL {url}: {err}"))
}

fn default_model() -> String {
    "GigaChat".to_owned()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rate_limit_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LlmError {
    #[error("LLM provider responded with an error (HTTP status code: {status}):\n{body}")]
    BadStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("LLM provider kept rate-limiting the request after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("LLM provider returned no completion choices or an empty message")]
    EmptyResponse,

    #[error("LLM provider returned a token with invalid expiration timestamp: {expires_at}")]
    InvalidTokenExpiry { expires_at: i64 },
}
