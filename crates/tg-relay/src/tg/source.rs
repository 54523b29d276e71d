use crate::media::{Dimensions, MediaKind, MediaRef};
use crate::prelude::*;
use crate::relay::{EventHub, SourceChat, SourceClient, SourceMessage};
use crate::util::{retry, DynError, Opaque};
use crate::{err, err_ctx, tg, Result};
use async_trait::async_trait;
use futures::prelude::*;
use grammers_client::types::{Chat, Downloadable, Media, Message};
use grammers_client::{Client, Config, FixedReconnect, InitParams, Update};
use grammers_session::{PackedChat, Session};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// How often the connection is checked when there are no updates
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// The client never gives up reconnecting, the relay is useless without it
static RECONNECT_POLICY: FixedReconnect = FixedReconnect {
    attempts: usize::MAX,
    delay: CONNECT_INTERVAL,
};

/// Reads the source chats on behalf of the user via MTProto
pub(crate) struct TgSource {
    client: Client,
    session_file: PathBuf,
}

impl TgSource {
    /// Connects with the session saved by the `login` command
    #[instrument(skip_all, fields(session_file = %cfg.session_file.display()))]
    pub(crate) async fn connect(cfg: &tg::ClientConfig) -> Result<Self> {
        let policy = retry::fixed_interval_policy(CONNECT_ATTEMPTS, CONNECT_INTERVAL);

        let client = retry::retry(
            "connect_tg_client",
            &policy,
            || connect_client(cfg),
            // The session file is either broken or missing, no point in retrying
            |err: &crate::Error| !matches!(
                err.kind(),
                crate::ErrorKind::TgClient {
                    source: TgClientError::LoadSession { .. }
                }
            ),
        )
        .await?;

        let authorized = client
            .is_authorized()
            .await
            .map_err(err_ctx!(TgClientError::Invocation {
                request: "is_authorized"
            }))?;

        if !authorized {
            return Err(err!(TgClientError::Unauthorized));
        }

        info!("Connected to Telegram as a user");

        Ok(Self {
            client,
            session_file: cfg.session_file.clone(),
        })
    }

    /// Publishes new messages to the hub until `shutdown` is signalled
    pub(crate) async fn run_updates(&self, hub: &EventHub, mut shutdown: watch::Receiver<()>) {
        info!("Listening for the updates from the source");

        let mut health = ConnectionHealth::default();

        loop {
            let update = tokio::select! {
                _ = shutdown.changed() => break,
                update = self.client.next_update() => update,
            };

            health.report(&update, "Receiving updates");

            match update {
                Ok(Update::NewMessage(message)) if !message.outgoing() => {
                    let message = source_message(&message);
                    trace!(
                        chat_id = message.chat_id,
                        message_id = message.id,
                        forwarded = message.forwarded,
                        "Received a new message"
                    );
                    hub.publish(message);
                }
                Ok(_) => {}
                Err(_) => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }

        info!("Stopped listening for the updates");
    }

    /// Pings Telegram every minute until `shutdown` is signalled. The pings
    /// go through the reconnection policy, so a dropped connection is
    /// restored even when no updates arrive.
    pub(crate) async fn keep_alive(&self, shutdown: watch::Receiver<()>) {
        let client = &self.client;
        run_keep_alive(KEEP_ALIVE_INTERVAL, shutdown, || async move {
            client.get_me().await.map(drop)
        })
        .await;
    }

    pub(crate) fn save_session(&self) -> Result {
        save_session(&self.client, &self.session_file)
    }

    async fn find_in_dialogs(&self, id: i64) -> Result<Option<Chat>> {
        let mut dialogs = self.client.iter_dialogs();

        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(err_ctx!(TgClientError::Invocation {
                request: "iter_dialogs"
            }))?
        {
            if dialog.chat().id() == id {
                return Ok(Some(dialog.chat().clone()));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl SourceClient for TgSource {
    async fn lookup_chat(&self, identifier: &str) -> Result<Option<SourceChat>> {
        let chat = match ChatIdentifier::parse(identifier) {
            ChatIdentifier::Id(id) => self.find_in_dialogs(id).await?,
            ChatIdentifier::Username(username) => self
                .client
                .resolve_username(username)
                .await
                .map_err(err_ctx!(TgClientError::Invocation {
                    request: "resolve_username"
                }))?,
        };

        Ok(chat.map(|chat| SourceChat {
            id: chat.id(),
            title: chat.name().to_owned(),
            handle: Opaque::new(chat.pack()),
        }))
    }

    #[instrument(skip_all, fields(path = %path.display(), size = media.size))]
    async fn download_media(&self, media: &MediaRef, path: &Path) -> Result {
        let handle = media
            .handle
            .downcast_ref::<Media>()
            .fatal_ctx(|| "BUG: media handle doesn't belong to the Telegram source")?;

        let mut file = fs_err::tokio::File::create(path).await?;
        let mut download = self
            .client
            .iter_download(&Downloadable::Media(handle.clone()));

        while let Some(chunk) = download
            .next()
            .await
            .map_err(err_ctx!(TgClientError::Invocation { request: "download" }))?
        {
            file.write_all(&chunk).await?;
        }

        file.flush().await?;

        Ok(())
    }

    async fn recent_messages(
        &self,
        chat: &SourceChat,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        let packed = *chat
            .handle
            .downcast_ref::<PackedChat>()
            .fatal_ctx(|| "BUG: chat handle doesn't belong to the Telegram source")?;

        let mut iter = self.client.iter_messages(packed).limit(limit);
        let mut messages = vec![];

        while let Some(message) = iter
            .next()
            .await
            .map_err(err_ctx!(TgClientError::Invocation {
                request: "iter_messages"
            }))?
        {
            messages.push(source_message(&message));
        }

        // Telegram returns the newest messages first
        messages.reverse();

        Ok(messages)
    }
}

pub(super) async fn connect_client(cfg: &tg::ClientConfig) -> Result<Client> {
    let session = Session::load_file_or_create(&cfg.session_file).map_err(err_ctx!(
        TgClientError::LoadSession {
            path: cfg.session_file.clone()
        }
    ))?;

    Client::connect(Config {
        session,
        api_id: cfg.api_id,
        api_hash: cfg.api_hash.clone(),
        params: InitParams {
            reconnection_policy: &RECONNECT_POLICY,
            ..Default::default()
        },
    })
    .await
    .map_err(err_ctx!(TgClientError::Connect))
}

pub(super) fn save_session(client: &Client, path: &Path) -> Result {
    client
        .session()
        .save_to_file(path)
        .map_err(err_ctx!(TgClientError::SaveSession {
            path: path.to_owned()
        }))?;

    debug!(path = %path.display(), "Saved the Telegram session");

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ChatIdentifier<'a> {
    /// Bare ID of the chat as it is known to MTProto
    Id(i64),
    Username(&'a str),
}

impl<'a> ChatIdentifier<'a> {
    /// Bot API style IDs of channels (`-100` prefix) and groups (`-` prefix)
    /// are converted to bare IDs
    fn parse(identifier: &'a str) -> Self {
        let identifier = identifier.trim();

        let digits = identifier
            .strip_prefix("-100")
            .or_else(|| identifier.strip_prefix('-'))
            .unwrap_or(identifier);

        if !digits.is_empty() && digits.bytes().all(|byte| byte.is_ascii_digit()) {
            if let Ok(id) = digits.parse() {
                return Self::Id(id);
            }
        }

        Self::Username(identifier.trim_start_matches('@'))
    }
}

fn source_message(message: &Message) -> SourceMessage {
    SourceMessage {
        chat_id: message.chat().id(),
        id: message.id(),
        text: message.text().to_owned(),
        media: message.media().and_then(media_ref),
        forwarded: message.forward_header().is_some(),
    }
}

fn media_ref(media: Media) -> Option<MediaRef> {
    let (kind, mime_type, size) = match &media {
        Media::Photo(_) => (MediaKind::Photo, "image/jpeg".to_owned(), 0),
        Media::Document(document) => {
            let mime_type = document
                .mime_type()
                .unwrap_or("application/octet-stream")
                .to_owned();

            let kind = media_kind(&DocumentInfo {
                mime_type: &mime_type,
                file_name: document.name(),
                animated: document.is_animated(),
                resolution: document.resolution(),
            });
            let size = u64::try_from(document.size()).unwrap_or_default();

            (kind, mime_type, size)
        }
        _ => {
            debug!(?media, "Unsupported media type, only the text is relayed");
            return None;
        }
    };

    Some(MediaRef {
        kind,
        mime_type,
        size,
        handle: Opaque::new(media),
    })
}

/// Attributes of a document that decide how it's relayed
struct DocumentInfo<'a> {
    mime_type: &'a str,
    file_name: &'a str,

    /// Telegram "GIFs" are silent mp4 videos with this flag
    animated: bool,

    /// Width and height of videos and images
    resolution: Option<(i32, i32)>,
}

fn media_kind(doc: &DocumentInfo<'_>) -> MediaKind {
    let DocumentInfo {
        mime_type,
        file_name,
        animated,
        resolution,
    } = *doc;

    if mime_type == "image/gif" || (animated && mime_type.starts_with("video/")) {
        return MediaKind::Animation;
    }
    if mime_type.starts_with("video/") {
        let dimensions = resolution.and_then(|(width, height)| Dimensions::new(width, height));
        return MediaKind::Video { dimensions };
    }
    if mime_type.starts_with("audio/") {
        return MediaKind::Audio;
    }
    if mime_type.starts_with("image/") {
        return MediaKind::Photo;
    }

    let file_name = Some(file_name)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned);

    MediaKind::Document { file_name }
}

/// Counts consecutive failed calls to Telegram, so that the loss and the
/// restoration of the connection are logged once instead of on every call
#[derive(Debug, Default)]
struct ConnectionHealth {
    failures: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum HealthChange {
    Unchanged,
    Lost,
    Restored { failures: u32 },
}

impl ConnectionHealth {
    fn record<T, E>(&mut self, result: &std::result::Result<T, E>) -> HealthChange {
        match (result, self.failures) {
            (Ok(_), 0) => HealthChange::Unchanged,
            (Ok(_), failures) => {
                self.failures = 0;
                HealthChange::Restored { failures }
            }
            (Err(_), 0) => {
                self.failures = 1;
                HealthChange::Lost
            }
            (Err(_), _) => {
                self.failures += 1;
                HealthChange::Unchanged
            }
        }
    }

    fn report<T, E>(&mut self, result: &std::result::Result<T, E>, operation: &str)
    where
        E: std::error::Error + 'static,
    {
        let change = self.record(result);
        let Err(err) = result else {
            if let HealthChange::Restored { failures } = change {
                info!(failures, "{operation}: connection to Telegram is restored");
            }
            return;
        };

        if change == HealthChange::Lost {
            error!(
                err = tracing_err(err),
                "{operation}: lost the connection to Telegram, reconnecting..."
            );
        } else {
            debug!(
                err = tracing_err(err),
                failures = self.failures,
                "{operation}: Telegram is still unreachable"
            );
        }
    }
}

async fn run_keep_alive<F, Fut, E>(
    interval: Duration,
    mut shutdown: watch::Receiver<()>,
    mut ping: F,
) -> ConnectionHealth
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), E>>,
    E: std::error::Error + 'static,
{
    let mut health = ConnectionHealth::default();
    let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {}
        }

        let result = ping().await;
        health.report(&result, "Keep-alive");
    }

    health
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TgClientError {
    #[error("Failed to connect to Telegram")]
    Connect { source: Box<DynError> },

    #[error("Failed to request the login code")]
    RequestLoginCode { source: Box<DynError> },

    #[error("Telegram request `{request}` failed")]
    Invocation {
        request: &'static str,
        source: grammers_client::InvocationError,
    },

    #[error("The Telegram session is not authorized, run the `login` command first")]
    Unauthorized,

    #[error("Failed to sign in to Telegram")]
    SignIn {
        source: grammers_client::SignInError,
    },

    #[error("Failed to load the Telegram session from {path:?}")]
    LoadSession {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to save the Telegram session to {path:?}")]
    SaveSession {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_identifiers() {
        use ChatIdentifier::*;

        assert_eq!(ChatIdentifier::parse("@news"), Username("news"));
        assert_eq!(ChatIdentifier::parse(" news "), Username("news"));
        assert_eq!(ChatIdentifier::parse("-1001234567"), Id(1234567));
        assert_eq!(ChatIdentifier::parse("-4321"), Id(4321));
        assert_eq!(ChatIdentifier::parse("98765"), Id(98765));
        assert_eq!(ChatIdentifier::parse("-100"), Username("-100"));
        assert_eq!(ChatIdentifier::parse("news_2024"), Username("news_2024"));
    }

    fn kind(mime_type: &str, file_name: &str) -> MediaKind {
        media_kind(&DocumentInfo {
            mime_type,
            file_name,
            animated: false,
            resolution: None,
        })
    }

    #[test]
    fn media_kinds_by_mime() {
        assert_eq!(kind("image/gif", ""), MediaKind::Animation);
        assert_eq!(kind("image/png", "a.png"), MediaKind::Photo);
        assert_eq!(
            kind("video/quicktime", "clip.mov"),
            MediaKind::Video { dimensions: None }
        );
        assert_eq!(kind("audio/mpeg", "song.mp3"), MediaKind::Audio);
        assert_eq!(
            kind("application/pdf", "report.pdf"),
            MediaKind::Document {
                file_name: Some("report.pdf".to_owned())
            }
        );
        assert_eq!(
            kind("application/octet-stream", ""),
            MediaKind::Document { file_name: None }
        );
    }

    #[test]
    fn video_dimensions_come_from_the_document() {
        let landscape = DocumentInfo {
            mime_type: "video/quicktime",
            file_name: "clip.mov",
            animated: false,
            resolution: Some((1920, 1080)),
        };
        assert_eq!(
            media_kind(&landscape),
            MediaKind::Video {
                dimensions: Some(Dimensions {
                    width: 1920,
                    height: 1080
                })
            }
        );

        let broken = DocumentInfo {
            resolution: Some((0, 1080)),
            ..landscape
        };
        assert_eq!(media_kind(&broken), MediaKind::Video { dimensions: None });
    }

    #[test]
    fn animated_mp4_is_an_animation() {
        let gif = DocumentInfo {
            mime_type: "video/mp4",
            file_name: "",
            animated: true,
            resolution: Some((480, 270)),
        };
        assert_eq!(media_kind(&gif), MediaKind::Animation);
    }

    #[test]
    fn connection_health_transitions() {
        let mut health = ConnectionHealth::default();
        let ok: std::result::Result<(), ()> = Ok(());
        let err: std::result::Result<(), ()> = Err(());

        assert_eq!(health.record(&ok), HealthChange::Unchanged);
        assert_eq!(health.record(&err), HealthChange::Lost);
        assert_eq!(health.record(&err), HealthChange::Unchanged);
        assert_eq!(health.record(&err), HealthChange::Unchanged);
        assert_eq!(health.record(&ok), HealthChange::Restored { failures: 3 });
        assert_eq!(health.record(&ok), HealthChange::Unchanged);
    }

    #[test]
    fn reconnection_never_gives_up() {
        use grammers_client::ReconnectionPolicy;
        use std::ops::ControlFlow;

        for attempt in [0, 1, 10, 10_000] {
            assert_eq!(
                RECONNECT_POLICY.should_retry(attempt),
                ControlFlow::Continue(CONNECT_INTERVAL)
            );
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn keep_alive_pings_every_interval_until_shutdown() {
        let interval = Duration::from_secs(60);
        let pings = std::sync::atomic::AtomicU32::new(0);
        let (stop, stopped) = watch::channel(());

        let stop_later = async move {
            tokio::time::sleep(interval * 3 + interval / 2).await;
            drop(stop);
        };

        let keep_alive = run_keep_alive(interval, stopped, || {
            let ping = pings.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            async move {
                // The connection is down during the second ping
                if ping == 2 {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, "down"));
                }
                Ok(())
            }
        });

        let ((), health) = tokio::join!(stop_later, keep_alive);

        assert_eq!(pings.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(health.failures, 0);
    }
}
