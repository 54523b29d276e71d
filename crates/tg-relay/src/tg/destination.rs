use crate::media::MediaKind;
use crate::prelude::*;
use crate::relay::{Destination, OutgoingMedia, RelayError};
use crate::{err, tg, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::InputFile;

/// Sends the relayed messages to the destination chat via the bot API
pub(crate) struct TgDestination {
    bot: tg::Bot,
    chat: ChatId,
}

impl TgDestination {
    pub(crate) fn new(bot: tg::Bot, chat: ChatId) -> Self {
        Self { bot, chat }
    }
}

/// Caption is an optional parameter of every media request, but there is
/// no common trait for setting it
macro_rules! send_with_caption {
    ($request:expr, $caption:expr) => {{
        let request = $request;
        match $caption {
            Some(caption) => request.caption(caption).await,
            None => request.await,
        }
    }};
}

#[async_trait]
impl Destination for TgDestination {
    #[instrument(skip(self), fields(chat = %self.chat))]
    async fn check_access(&self) -> Result {
        let me = self.bot.get_me().await?;
        let member = self.bot.get_chat_member(self.chat, me.id).await?;

        if !member.kind.is_present() {
            return Err(err!(RelayError::AccessDenied {
                chat: self.chat.to_string()
            }));
        }

        debug!(status = ?member.kind.status(), "The bot is a member of the destination chat");

        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result {
        self.bot.send_message(self.chat, text).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(kind = <&str>::from(media.kind), path = %media.path.display()))]
    async fn send_media(&self, media: OutgoingMedia<'_>) -> Result {
        let file = InputFile::file(media.path);
        let chat = self.chat;

        match media.kind {
            MediaKind::Photo => {
                send_with_caption!(self.bot.send_photo(chat, file), media.caption)?;
            }
            MediaKind::Video { dimensions } => {
                let mut request = self.bot.send_video(chat, file).supports_streaming(true);
                if let Some(dimensions) = dimensions {
                    request = request
                        .width(dimensions.width)
                        .height(dimensions.height);
                }
                send_with_caption!(request, media.caption)?;
            }
            MediaKind::Animation => {
                send_with_caption!(self.bot.send_animation(chat, file), media.caption)?;
            }
            MediaKind::Audio => {
                send_with_caption!(self.bot.send_audio(chat, file), media.caption)?;
            }
            MediaKind::Document { file_name } => {
                let file = match file_name {
                    Some(file_name) => file.file_name(file_name.clone()),
                    None => file,
                };
                send_with_caption!(self.bot.send_document(chat, file), media.caption)?;
            }
        }

        Ok(())
    }
}
