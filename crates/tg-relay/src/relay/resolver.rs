use super::{Destination, RelayError, SourceChat, SourceClient};
use crate::prelude::*;
use crate::{err, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Remembers the results of chat lookups for the lifetime of the process.
///
/// Negative results are cached as well. The caches are only reset via
/// [`ChatResolver::clear`]. The locks are held during the lookups, so the
/// same identifier is never looked up concurrently.
pub(crate) struct ChatResolver {
    source: Arc<dyn SourceClient>,
    chats: Mutex<HashMap<String, Option<SourceChat>>>,
    destination_access: Mutex<Option<bool>>,
}

impl ChatResolver {
    pub(crate) fn new(source: Arc<dyn SourceClient>) -> Self {
        Self {
            source,
            chats: Default::default(),
            destination_access: Default::default(),
        }
    }

    #[instrument(skip(self))]
    pub(crate) async fn resolve(&self, identifier: &str) -> Result<SourceChat> {
        let identifier = identifier.trim();
        let mut chats = self.chats.lock().await;

        let chat = match chats.get(identifier) {
            Some(cached) => cached.clone(),
            None => {
                let chat = self.source.lookup_chat(identifier).await?;
                chats.insert(identifier.to_owned(), chat.clone());
                chat
            }
        };

        chat.ok_or_else(|| {
            err!(RelayError::ChatNotFound {
                identifier: identifier.to_owned(),
            })
        })
    }

    /// Fails with [`RelayError::AccessDenied`] if the destination isn't writable
    pub(crate) async fn ensure_destination_access(
        &self,
        destination: &dyn Destination,
        chat: &str,
    ) -> Result {
        let mut access = self.destination_access.lock().await;

        let has_access = match *access {
            Some(has_access) => has_access,
            None => {
                let has_access = match destination.check_access().await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(
                            err = tracing_err(&err),
                            chat, "Destination chat is not accessible"
                        );
                        false
                    }
                };
                *access = Some(has_access);
                has_access
            }
        };

        if !has_access {
            return Err(err!(RelayError::AccessDenied {
                chat: chat.to_owned()
            }));
        }

        Ok(())
    }

    pub(crate) async fn clear(&self) {
        self.chats.lock().await.clear();
        *self.destination_access.lock().await = None;
        debug!("Cleared the chat resolution caches");
    }
}
