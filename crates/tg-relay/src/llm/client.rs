use super::model::{ChatMessage, ChatRequest, ChatResponse, Role, TokenResponse};
use super::prompts::{self, Sampling};
use super::token::{AccessToken, TokenCache};
use super::{Config, LlmError};
use crate::http::{self, HttpClientError};
use crate::observability::metrics::{LLM_REQUESTS_TOTAL, LLM_TOKEN_REFRESHES_TOTAL};
use crate::prelude::*;
use crate::{err, err_ctx, Result};
use chrono::prelude::*;
use futures::prelude::*;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use std::collections::HashMap;

/// Total number of attempts for a request that is answered with 429
const MAX_RATE_LIMITED_ATTEMPTS: u32 = 3;

/// Max number of completion requests in flight for batch operations
const BATCH_CONCURRENCY: usize = 5;

pub(crate) struct LlmClient {
    http: http::Client,
    config: Config,
    token: TokenCache,

    /// Completions keyed by the exact system prompt and user content.
    /// `None` if caching is disabled.
    responses: Option<Mutex<HashMap<(String, String), String>>>,
}

struct Completion<'a> {
    system: Option<&'a str>,
    content: &'a str,
    sampling: Sampling,
}

impl LlmClient {
    pub(crate) fn new(config: Config) -> Result<Self> {
        let http = http::create_client(http::ClientOptions {
            timeout: config.request_timeout,
            accept_invalid_certs: config.accept_invalid_certs,
        })?;

        Ok(Self {
            http,
            responses: config.cache_responses.then(Default::default),
            token: TokenCache::default(),
            config,
        })
    }

    /// Rewrites the text so that it doesn't look like a copy of the source
    #[instrument(skip_all, fields(text_len = text.len()))]
    pub(crate) async fn rewrite(&self, text: &str) -> Result<String> {
        let prompt = prompts::rewrite(text);
        self.complete(Completion {
            system: None,
            content: &prompt,
            sampling: prompts::REWRITE,
        })
        .log_outcome("LLM rewrite")
        .await
    }

    /// Rewrites all texts with bounded parallelism. The output has the same
    /// order as the input, every text gets its own result.
    pub(crate) async fn rewrite_batch(&self, texts: &[String]) -> Vec<Result<String>> {
        // Must be collected eagerly, a lazy `map` over the borrowed texts
        // fails the higher-ranked `Send` check in the async callers
        let rewrites: Vec<_> = texts.iter().map(|text| self.rewrite(text)).collect();

        stream::iter(rewrites)
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await
    }

    /// Asks the model whether the text is an advertisement
    #[instrument(skip_all, fields(text_len = text.len()))]
    pub(crate) async fn check_for_ads(&self, text: &str) -> Result<bool> {
        let prompt = prompts::ad_check(text);
        let answer = self
            .complete(Completion {
                system: Some(prompts::AD_CHECK_SYSTEM),
                content: &prompt,
                sampling: prompts::STRICT,
            })
            .await?;

        let is_ad = answer.contains(prompts::AD_CHECK_POSITIVE_ANSWER);

        debug!(%answer, is_ad, "LLM ad check answered");

        Ok(is_ad)
    }

    pub(crate) fn clear_cache(&self) {
        if let Some(responses) = &self.responses {
            responses.lock().clear();
        }
    }

    pub(crate) async fn token(&self) -> Result<AccessToken> {
        self.token.get_or_refresh(|| self.fetch_token()).await
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        let request_id = uuid::Uuid::new_v4();

        debug!(%request_id, "Requesting a new LLM access token");

        let response: TokenResponse = self
            .http
            .post(self.config.oauth_url.clone())
            .header("RqUID", request_id.to_string())
            .header(AUTHORIZATION, format!("Basic {}", self.config.auth_key))
            .header(ACCEPT, "application/json")
            .form(&[("scope", self.config.scope.as_str())])
            .read_json()
            .await?;

        let expires_at = Utc
            .timestamp_millis_opt(response.expires_at)
            .single()
            .ok_or_else(|| {
                err!(LlmError::InvalidTokenExpiry {
                    expires_at: response.expires_at
                })
            })?;

        metrics::counter!(LLM_TOKEN_REFRESHES_TOTAL).increment(1);

        info!(%expires_at, "Obtained a new LLM access token");

        Ok(AccessToken {
            value: response.access_token,
            expires_at,
        })
    }

    async fn complete(&self, completion: Completion<'_>) -> Result<String> {
        let cache_key = (
            completion.system.unwrap_or_default().to_owned(),
            completion.content.to_owned(),
        );

        if let Some(responses) = &self.responses {
            if let Some(cached) = responses.lock().get(&cache_key) {
                debug!("Using cached LLM response");
                metrics::counter!(LLM_REQUESTS_TOTAL, "outcome" => "cache_hit").increment(1);
                return Ok(cached.clone());
            }
        }

        let result = self.complete_uncached(&completion).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => match err.kind() {
                crate::ErrorKind::Llm {
                    source: LlmError::RateLimited { .. },
                } => "rate_limited",
                _ => "error",
            },
        };
        metrics::counter!(LLM_REQUESTS_TOTAL, "outcome" => outcome).increment(1);

        let response = result?;

        if let Some(responses) = &self.responses {
            responses.lock().insert(cache_key, response.clone());
        }

        Ok(response)
    }

    async fn complete_uncached(&self, completion: &Completion<'_>) -> Result<String> {
        let url = format!(
            "{}/chat/completions",
            self.config.api_url.as_str().trim_end_matches('/')
        );

        let messages = completion
            .system
            .filter(|system| !system.is_empty())
            .map(|system| ChatMessage {
                role: Role::System,
                content: system.to_owned(),
            })
            .into_iter()
            .chain([ChatMessage {
                role: Role::User,
                content: completion.content.to_owned(),
            }])
            .collect();

        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: completion.sampling.temperature,
            top_p: completion.sampling.top_p,
            n: 1,
            stream: false,
            max_tokens: completion.sampling.max_tokens,
            repetition_penalty: 1.0,
        };

        let mut attempt = 1;
        let mut token_refreshed = false;

        loop {
            let token = self.token().await?;

            let response = self
                .http
                .post(&url)
                .bearer_auth(&token.value)
                .header(ACCEPT, "application/json")
                .json(&request)
                .send()
                .await
                .map_err(err_ctx!(HttpClientError::Request))?;

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= MAX_RATE_LIMITED_ATTEMPTS {
                    return Err(err!(LlmError::RateLimited { attempts: attempt }));
                }

                let backoff = self.config.rate_limit_backoff;
                warn!(
                    attempt,
                    backoff = format_args!("{backoff:.2?}"),
                    "LLM provider rate-limited the request, sleeping before the next attempt"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED && !token_refreshed {
                warn!("LLM access token was rejected, requesting a new one");
                self.token.invalidate(&token.value).await;
                token_refreshed = true;
                continue;
            }

            if !status.is_success() {
                let body = response.error_body().await;
                return Err(err!(LlmError::BadStatus { status, body }));
            }

            let response: ChatResponse = response.read_json().await?;

            let content = response
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .filter(|content| !content.trim().is_empty())
                .ok_or_else(|| err!(LlmError::EmptyResponse))?;

            return Ok(content);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ErrorKind;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

    pub(crate) fn test_config(server: &MockServer) -> Config {
        Config {
            auth_key: "dGVzdDp0ZXN0".to_owned(),
            scope: "GIGACHAT_API_PERS".to_owned(),
            oauth_url: format!("{}/oauth", server.uri()).parse().unwrap(),
            api_url: format!("{}/api/v1", server.uri()).parse().unwrap(),
            model: "GigaChat".to_owned(),
            request_timeout: Duration::from_secs(5),
            rate_limit_backoff: Duration::from_millis(10),
            cache_responses: false,
            accept_invalid_certs: false,
        }
    }

    pub(crate) fn token_body(token: &str, ttl: chrono::Duration) -> serde_json::Value {
        json!({
            "access_token": token,
            "expires_at": (Utc::now() + ttl).timestamp_millis(),
        })
    }

    pub(crate) fn completion_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{
                "message": { "role": "assistant", "content": content },
                "index": 0,
                "finish_reason": "stop",
            }],
            "created": 1_700_000_000,
            "model": "GigaChat",
            "object": "chat.completion",
        })
    }

    async fn mount_token(server: &MockServer, token: &str, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/oauth"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body(token, chrono::Duration::minutes(30))),
            )
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    fn completions() -> MockBuilder {
        Mock::given(method("POST")).and(path("/api/v1/chat/completions"))
    }

    #[test_log::test(tokio::test)]
    async fn token_request_has_expected_shape() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth"))
            .and(header("authorization", "Basic dGVzdDp0ZXN0"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(header_exists("rquid"))
            .and(body_string_contains("scope=GIGACHAT_API_PERS"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("t1", chrono::Duration::minutes(30))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();
        assert_eq!(client.token().await.unwrap().value, "t1");
    }

    #[test_log::test(tokio::test)]
    async fn token_is_reused_within_expiry_window() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        let first = client.token().await.unwrap();
        let second = client.token().await.unwrap();

        assert_eq!(first.value, "t1");
        assert_eq!(first, second);
    }

    #[test_log::test(tokio::test)]
    async fn expired_token_is_refreshed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("expired", chrono::Duration::seconds(-1))),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        mount_token(&server, "fresh", 1).await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        let first = client.token().await.unwrap();
        let second = client.token().await.unwrap();

        assert_eq!(first.value, "expired");
        assert_eq!(second.value, "fresh");
    }

    #[test_log::test(tokio::test)]
    async fn completion_sends_system_prompt_and_bearer_token() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        completions()
            .and(header("authorization", "Bearer t1"))
            .and(body_string_contains(r#""role":"system""#))
            .and(body_string_contains(r#""model":"GigaChat""#))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Нет")))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        assert!(!client.check_for_ads("Обычная новость").await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn three_rate_limited_responses_fail_the_call() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        completions()
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        let err = client.rewrite("текст").await.unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Llm {
                source: LlmError::RateLimited { attempts: 3 }
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn rate_limited_request_succeeds_on_retry() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        completions()
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        completions()
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Новый текст")))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        assert_eq!(client.rewrite("текст").await.unwrap(), "Новый текст");
    }

    #[test_log::test(tokio::test)]
    async fn rejected_token_is_refreshed_once() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body("revoked", chrono::Duration::minutes(30))),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        mount_token(&server, "valid", 1).await;

        completions()
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        completions()
            .and(header("authorization", "Bearer valid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        assert_eq!(client.rewrite("текст").await.unwrap(), "ok");
    }

    #[test_log::test(tokio::test)]
    async fn second_unauthorized_response_is_an_error() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 2).await;

        completions()
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .expect(2)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        let err = client.rewrite("текст").await.unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Llm {
                source: LlmError::BadStatus { status, body }
            } if *status == StatusCode::UNAUTHORIZED && body == "nope"
        );
    }

    #[test_log::test(tokio::test)]
    async fn other_error_statuses_are_not_retried() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        completions()
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        let err = client.rewrite("текст").await.unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Llm {
                source: LlmError::BadStatus { .. }
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn empty_choices_are_an_error() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        completions()
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let client = LlmClient::new(test_config(&server)).unwrap();

        let err = client.rewrite("текст").await.unwrap_err();

        assert_matches!(
            err.kind(),
            ErrorKind::Llm {
                source: LlmError::EmptyResponse
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn identical_requests_are_served_from_cache() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        completions()
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("Да")))
            .expect(2)
            .mount(&server)
            .await;

        let config = Config {
            cache_responses: true,
            ..test_config(&server)
        };
        let client = LlmClient::new(config).unwrap();

        assert!(client.check_for_ads("Купите слона").await.unwrap());
        assert!(client.check_for_ads("Купите слона").await.unwrap());

        client.clear_cache();

        assert!(client.check_for_ads("Купите слона").await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn batch_rewrite_preserves_order() {
        let server = MockServer::start().await;
        mount_token(&server, "t1", 1).await;

        for i in 0..7 {
            completions()
                .and(body_string_contains(format!("text-{i}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(completion_body(&format!("rewritten-{i}")))
                        .set_delay(Duration::from_millis(10 * (7 - i))),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let client = LlmClient::new(test_config(&server)).unwrap();

        let texts: Vec<_> = (0..7).map(|i| format!("text-{i}")).collect();

        let rewritten: Vec<_> = client
            .rewrite_batch(&texts)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let expected: Vec<_> = (0..7).map(|i| format!("rewritten-{i}")).collect();

        assert_eq!(rewritten, expected);
    }
}
