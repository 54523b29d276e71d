use super::{Destination, OutgoingMedia, RelayError, SourceClient, SourceMessage, WatchMode};
use crate::filter::Filter;
use crate::llm::LlmClient;
use crate::media::{MediaRef, Transcoder};
use crate::observability::metrics::RELAY_MESSAGES_TOTAL;
use crate::prelude::*;
use crate::util::size::human_size;
use crate::{err, err_ctx, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;

/// Telegram doesn't accept longer captions for media
const MAX_CAPTION_CHARS: usize = 1024;

/// Telegram doesn't accept longer text messages
const MAX_TEXT_CHARS: usize = 4096;

/// Length of the random part of the downloaded files names
const TEMP_NAME_RAND_CHARS: usize = 6;

pub(crate) struct Pipeline {
    pub(crate) source: Arc<dyn SourceClient>,
    pub(crate) destination: Arc<dyn Destination>,
    pub(crate) llm: Arc<LlmClient>,
    pub(crate) filter: Arc<Filter>,
    pub(crate) transcoder: Arc<dyn Transcoder>,
    pub(crate) media_dir: PathBuf,
    pub(crate) max_upload_size: u64,
    pub(crate) ai_ad_check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Outcome {
    Relayed,

    /// Relaying the message failed, but its original text was sent
    RelayedOriginal,

    /// Some parts of the message were sent before a failure. The original
    /// text isn't sent then, it would duplicate them.
    RelayedPartially,

    DroppedAd,

    /// The original text looks like an LLM refusal or touches a sensitive topic
    DroppedRefusal,

    /// Neither text nor media
    Skipped,

    Failed,
}

impl Pipeline {
    /// Relays a new message of a watched chat. Errors don't escape this
    /// function, they are logged and the original text is relayed if possible.
    pub(crate) async fn handle(&self, mode: WatchMode, message: SourceMessage) -> Outcome {
        let span = info_span!(
            "relay",
            chat_id = message.chat_id,
            message_id = message.id,
            %mode,
            forwarded = message.forwarded,
            media = message.media.as_ref().map(|media| <&str>::from(&media.kind)),
        );

        async {
            let mut delivered = 0;
            let outcome = match self.try_handle(mode, &message, &mut delivered).await {
                Ok(outcome) => outcome,
                Err(err) => self.recover(&message, delivered, &err).await,
            };

            debug!(outcome = <&str>::from(outcome), "Finished processing the message");

            metrics::counter!(
                RELAY_MESSAGES_TOTAL,
                "mode" => <&'static str>::from(mode),
                "outcome" => <&'static str>::from(outcome)
            )
            .increment(1);

            outcome
        }
        .instrument(span)
        .await
    }

    async fn try_handle(
        &self,
        mode: WatchMode,
        message: &SourceMessage,
        delivered: &mut usize,
    ) -> Result<Outcome> {
        if message.text.trim().is_empty() && message.media.is_none() {
            return Ok(Outcome::Skipped);
        }

        if self.filter.is_advertisement(&message.text) {
            return Ok(Outcome::DroppedAd);
        }

        let text = match mode {
            WatchMode::Plain => message.text.clone(),
            WatchMode::Ai => {
                if self.filter.is_error_or_sensitive(&message.text) {
                    return Ok(Outcome::DroppedRefusal);
                }

                if self.ai_ad_check && self.llm_detects_ad(&message.text).await {
                    return Ok(Outcome::DroppedAd);
                }

                self.rewrite(&message.text).await
            }
        };

        self.relay(message, &text, delivered).await?;

        Ok(Outcome::Relayed)
    }

    /// Sends the message with the given text without any filtering.
    /// Falls back to the original text of the message if nothing was sent.
    pub(crate) async fn deliver(&self, message: &SourceMessage, text: &str) -> Outcome {
        let mut delivered = 0;
        match self.relay(message, text, &mut delivered).await {
            Ok(()) => Outcome::Relayed,
            Err(err) => self.recover(message, delivered, &err).await,
        }
    }

    /// `delivered` is the number of messages that reached the destination
    /// before the `err` happened
    async fn recover(&self, message: &SourceMessage, delivered: usize, err: &Error) -> Outcome {
        if delivered > 0 {
            error!(
                err = tracing_err(err),
                chat_id = message.chat_id,
                message_id = message.id,
                delivered,
                "The message was relayed only partially"
            );
            return Outcome::RelayedPartially;
        }

        warn!(
            err = tracing_err(err),
            chat_id = message.chat_id,
            message_id = message.id,
            "Failed to relay the message"
        );
        self.relay_original(message).await
    }

    async fn relay_original(&self, message: &SourceMessage) -> Outcome {
        if message.text.trim().is_empty() {
            return Outcome::Failed;
        }

        let mut delivered = 0;
        match self.send_text(&message.text, &mut delivered).await {
            Ok(()) => {
                info!("Relayed the original text of the message as a fallback");
                Outcome::RelayedOriginal
            }
            Err(err) if delivered > 0 => {
                error!(
                    err = tracing_err(&err),
                    delivered,
                    "The original text of the message was relayed only partially"
                );
                Outcome::RelayedPartially
            }
            Err(err) => {
                error!(
                    err = tracing_err(&err),
                    "Failed to relay even the original text of the message"
                );
                Outcome::Failed
            }
        }
    }

    /// Never returns a refusal of the model. The original text is returned
    /// if the model refuses to rewrite it or the request fails.
    pub(crate) async fn rewrite(&self, original: &str) -> String {
        if original.trim().is_empty() {
            return original.to_owned();
        }
        let rewritten = self.llm.rewrite(original).await;
        self.accept_rewrite(original, rewritten)
    }

    /// Same as [`Pipeline::rewrite`] but for many texts at once
    pub(crate) async fn rewrite_batch(&self, originals: &[String]) -> Vec<String> {
        self.llm
            .rewrite_batch(originals)
            .await
            .into_iter()
            .zip(originals)
            .map(|(rewritten, original)| {
                if original.trim().is_empty() {
                    return original.clone();
                }
                self.accept_rewrite(original, rewritten)
            })
            .collect()
    }

    fn accept_rewrite(&self, original: &str, rewritten: Result<String>) -> String {
        match rewritten {
            Ok(rewritten) if self.filter.is_error_or_sensitive(&rewritten) => {
                warn!(%rewritten, "LLM refused to rewrite the text, using the original");
                original.to_owned()
            }
            Ok(rewritten) => rewritten,
            Err(err) => {
                warn!(
                    err = tracing_err(&err),
                    "Failed to rewrite the text, using the original"
                );
                original.to_owned()
            }
        }
    }

    async fn llm_detects_ad(&self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        match self.llm.check_for_ads(text).await {
            Ok(is_ad) => {
                if is_ad {
                    info!("LLM classified the text as an advertisement");
                }
                is_ad
            }
            Err(err) => {
                warn!(
                    err = tracing_err(&err),
                    "LLM ad check failed, assuming there is no ad"
                );
                false
            }
        }
    }

    /// Increments `delivered` for every message that reaches the destination
    async fn relay(&self, message: &SourceMessage, text: &str, delivered: &mut usize) -> Result {
        match &message.media {
            Some(media) => self.relay_media(message, media, text, delivered).await,
            None => self.send_text(text, delivered).await,
        }
    }

    /// The downloaded and converted files are removed when this function
    /// returns, regardless of the result.
    async fn relay_media(
        &self,
        message: &SourceMessage,
        media: &MediaRef,
        text: &str,
        delivered: &mut usize,
    ) -> Result {
        self.check_size(media.size)?;

        fs_err::tokio::create_dir_all(&self.media_dir).await?;

        let file_name = format!("{}_{}", message.chat_id, message.id);

        let original = self.temp_path(&file_name, media.file_extension())?;

        self.source
            .download_media(media, &original)
            .log_outcome("Media download")
            .await?;

        let converted;
        let upload: &Path = if media.needs_transcode() {
            converted = self.temp_path(&format!("converted_{file_name}"), "mp4")?;

            self.transcoder
                .to_mp4(&original, &converted, media.target_dimensions())
                .await?;

            &converted
        } else {
            &original
        };

        let size = fs_err::tokio::metadata(upload).await?.len();
        self.check_size(size)?;

        debug!(size = %human_size(size), path = %upload.display(), "Uploading media");

        let (caption, overflow) = split_caption(text);

        self.destination
            .send_media(OutgoingMedia {
                kind: &media.kind,
                path: upload,
                caption,
            })
            .await?;

        *delivered += 1;

        if let Some(overflow) = overflow {
            self.send_text(overflow, delivered).await?;
        }

        Ok(())
    }

    /// Creates an empty file named `{name}_{random}.{extension}` in the media
    /// directory. The same message may be relayed concurrently by a watch
    /// and a summary, so the names must not clash.
    fn temp_path(&self, name: &str, extension: &str) -> Result<TempPath> {
        let path = tempfile::Builder::new()
            .prefix(&format!("{name}_"))
            .suffix(&format!(".{extension}"))
            .rand_bytes(TEMP_NAME_RAND_CHARS)
            .tempfile_in(&self.media_dir)
            .map_err(err_ctx!(crate::IoError::CreateTempFile))?
            .into_temp_path();

        Ok(path)
    }

    fn check_size(&self, size: u64) -> Result {
        if size > self.max_upload_size {
            return Err(err!(RelayError::SizeLimitExceeded {
                actual: size,
                limit: self.max_upload_size,
            }));
        }
        Ok(())
    }

    async fn send_text(&self, text: &str, delivered: &mut usize) -> Result {
        for chunk in text.chunks_by_chars(MAX_TEXT_CHARS) {
            self.destination.send_text(chunk).await?;
            *delivered += 1;
        }
        Ok(())
    }
}

/// Returns the caption for the media and the text that doesn't fit into it
fn split_caption(text: &str) -> (Option<&str>, Option<&str>) {
    let text = text.trim();
    if text.is_empty() {
        return (None, None);
    }
    if text.chars().count() <= MAX_CAPTION_CHARS {
        return (Some(text), None);
    }
    (None, Some(text))
}
