//! Relays messages from the watched source chats to the destination chat.
//!
//! The source and the destination are abstracted behind [`SourceClient`] and
//! [`Destination`] traits. The production implementations live in [`crate::tg`].

mod handler;
mod hub;
mod resolver;
mod service;
mod state;

use crate::media::{MediaKind, MediaRef};
use crate::util::Opaque;
use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) use handler::Pipeline;
pub(crate) use hub::EventHub;
pub(crate) use resolver::ChatResolver;
pub(crate) use service::{Relay, SummaryPlan, WatchSummary};
pub(crate) use state::{StateStore, WatchState};

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_state_file")]
    pub(crate) state_file: PathBuf,

    /// Directory for the media downloaded from the source
    #[serde(default = "default_media_dir")]
    pub(crate) media_dir: PathBuf,

    /// Files bigger than this are not uploaded to the destination
    #[serde(default = "default_max_upload_mb")]
    pub(crate) max_upload_mb: u64,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(
        default = "default_transcode_timeout",
        rename = "transcode_timeout_secs"
    )]
    pub(crate) transcode_timeout: Duration,

    /// YAML file that overrides the builtin filter rules
    pub(crate) rules_file: Option<PathBuf>,

    /// Ask the LLM whether the message is an ad in addition to the regex filter
    #[serde(default)]
    pub(crate) ai_ad_check: bool,
}

fn default_state_file() -> PathBuf {
    "state.json".into()
}

fn default_media_dir() -> PathBuf {
    std::env::temp_dir().join("tg-relay")
}

fn default_max_upload_mb() -> u64 {
    50
}

fn default_transcode_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum WatchMode {
    /// Messages are relayed as is
    Plain,

    /// Message texts are rewritten by the LLM before relaying
    Ai,
}

/// Chat of the source that was found by its identifier
#[derive(Debug, Clone)]
pub(crate) struct SourceChat {
    pub(crate) id: i64,
    pub(crate) title: String,

    /// Source-specific reference to the chat
    pub(crate) handle: Opaque,
}

#[derive(Debug, Clone)]
pub(crate) struct SourceMessage {
    pub(crate) chat_id: i64,
    pub(crate) id: i32,
    pub(crate) text: String,
    pub(crate) media: Option<MediaRef>,

    /// The message was forwarded to the source chat from somewhere else
    pub(crate) forwarded: bool,
}

/// Client of the platform where the messages are taken from
#[async_trait]
pub(crate) trait SourceClient: Send + Sync {
    /// Returns `None` if there is no chat with such identifier or the user
    /// doesn't have access to it.
    async fn lookup_chat(&self, identifier: &str) -> Result<Option<SourceChat>>;

    async fn download_media(&self, media: &MediaRef, path: &Path) -> Result;

    /// Latest messages of the chat sorted from the oldest to the newest
    async fn recent_messages(&self, chat: &SourceChat, limit: usize)
        -> Result<Vec<SourceMessage>>;
}

/// The chat where all messages are relayed to
#[async_trait]
pub(crate) trait Destination: Send + Sync {
    async fn check_access(&self) -> Result;

    async fn send_text(&self, text: &str) -> Result;

    async fn send_media(&self, media: OutgoingMedia<'_>) -> Result;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OutgoingMedia<'a> {
    pub(crate) kind: &'a MediaKind,
    pub(crate) path: &'a Path,

    /// Already fits into the caption length limit
    pub(crate) caption: Option<&'a str>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RelayError {
    #[error("Chat `{identifier}` was not found or it's not accessible")]
    ChatNotFound { identifier: String },

    #[error("The bot has no access to the destination chat {chat}")]
    AccessDenied { chat: String },

    #[error("Media is too big to be uploaded ({actual} bytes), the limit is {limit} bytes")]
    SizeLimitExceeded { actual: u64, limit: u64 },

    #[error("None of the chats could be found: {}", .identifiers.join(", "))]
    NoChannelsResolved { identifiers: Vec<String> },

    #[error("Can't schedule {count} messages with the interval of {interval:?}")]
    ScheduleTooLong { count: usize, interval: Duration },
}

impl RelayError {
    pub(crate) fn is_user_error(&self) -> bool {
        match self {
            RelayError::ChatNotFound { .. }
            | RelayError::NoChannelsResolved { .. }
            | RelayError::ScheduleTooLong { .. } => true,
            RelayError::AccessDenied { .. } | RelayError::SizeLimitExceeded { .. } => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DeserializeError {
    #[error("Failed to deserialize the watch state from {path:?}")]
    WatchState {
        path: PathBuf,
        source: serde_json::Error,
    },
}
