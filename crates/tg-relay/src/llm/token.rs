use crate::Result;
use chrono::prelude::*;
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AccessToken {
    pub(crate) value: String,
    pub(crate) expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub(crate) fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Process-wide holder of the bearer token.
///
/// The lock is held for the whole duration of the refresh, so concurrent
/// callers that observe an expired token wait for a single in-flight refresh
/// instead of racing to obtain their own tokens.
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    token: tokio::sync::Mutex<Option<AccessToken>>,
}

impl TokenCache {
    pub(crate) async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>>,
    {
        let mut token = self.token.lock().await;

        if let Some(token) = token.as_ref().filter(|token| token.is_valid_at(Utc::now())) {
            return Ok(token.clone());
        }

        let fresh = refresh().await?;
        *token = Some(fresh.clone());

        Ok(fresh)
    }

    /// Forgets the token if it's still the one the server has rejected.
    /// If someone has already replaced it with a fresh one, it's kept.
    pub(crate) async fn invalidate(&self, rejected: &str) {
        let mut token = self.token.lock().await;
        if token.as_ref().is_some_and(|token| token.value == rejected) {
            *token = None;
        }
    }
}
