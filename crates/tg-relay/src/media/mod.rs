//! Media attached to the source messages.
//!
//! The kind of media is decided once, when the message is received from the
//! source. The rest of the relay only deals with [`MediaRef`].

mod transcode;

use crate::prelude::*;
use crate::util::Opaque;
use crate::Result;
use std::fmt;
use std::path::Path;

pub(crate) use transcode::{FfmpegTranscoder, TranscodeError, Transcoder};

/// Used when the source doesn't report the dimensions of a video
pub(crate) const DEFAULT_VIDEO_DIMENSIONS: Dimensions = Dimensions {
    width: 720,
    height: 1080,
};

/// Containers that Telegram can't stream and that need to be converted to mp4
const NON_STREAMABLE_VIDEO_MIME_TYPES: &[&str] = &[
    "video/quicktime",
    "video/x-msvideo",
    "video/x-matroska",
    "video/webm",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dimensions {
    pub(crate) width: u32,
    pub(crate) height: u32,
}

impl Dimensions {
    /// Telegram reports the resolution as signed numbers, zero or negative
    /// values mean it's unknown
    pub(crate) fn new(width: i32, height: i32) -> Option<Self> {
        let width = u32::try_from(width).ok().filter(|&width| width > 0)?;
        let height = u32::try_from(height).ok().filter(|&height| height > 0)?;
        Some(Self { width, height })
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum MediaKind {
    Photo,
    Video { dimensions: Option<Dimensions> },
    Animation,
    Audio,
    Document { file_name: Option<String> },
}

#[derive(Debug, Clone)]
pub(crate) struct MediaRef {
    pub(crate) kind: MediaKind,
    pub(crate) mime_type: String,

    /// Size reported by the source, it may be `0` if unknown
    pub(crate) size: u64,

    /// Source-specific reference used to download the media
    pub(crate) handle: Opaque,
}

impl MediaRef {
    pub(crate) fn file_extension(&self) -> &'static str {
        if self.kind == MediaKind::Photo {
            return "jpg";
        }

        if let Some(extension) = extension_for_mime(&self.mime_type) {
            return extension;
        }

        match self.kind {
            MediaKind::Video { .. } | MediaKind::Animation => "mp4",
            MediaKind::Audio => "mp3",
            MediaKind::Photo => "jpg",
            MediaKind::Document { .. } => "bin",
        }
    }

    pub(crate) fn needs_transcode(&self) -> bool {
        matches!(self.kind, MediaKind::Video { .. })
            && NON_STREAMABLE_VIDEO_MIME_TYPES.contains(&self.mime_type.as_str())
    }

    /// Dimensions to scale the video to when converting it
    pub(crate) fn target_dimensions(&self) -> Dimensions {
        match self.kind {
            MediaKind::Video {
                dimensions: Some(dimensions),
            } => dimensions,
            _ => DEFAULT_VIDEO_DIMENSIONS,
        }
    }
}

fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let extension = match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/tiff" => "tiff",

        "video/mp4" => "mp4",
        "video/x-msvideo" => "avi",
        "video/mpeg" => "mpeg",
        "video/webm" => "webm",
        "video/quicktime" => "mov",
        "video/x-matroska" => "mkv",
        "video/x-flv" => "flv",

        "audio/mpeg" => "mp3",
        "audio/x-wav" => "wav",
        "audio/ogg" => "ogg",
        "audio/aac" => "aac",
        "audio/flac" => "flac",
        "audio/webm" => "weba",

        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/vnd.ms-powerpoint" => "ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",

        "application/zip" => "zip",
        "application/x-rar-compressed" => "rar",
        "application/x-7z-compressed" => "7z",
        "application/gzip" => "gz",

        "text/plain" => "txt",
        "text/html" => "html",
        "text/css" => "css",
        "application/json" => "json",
        "application/javascript" => "js",
        "application/xml" => "xml",

        _ => return None,
    };

    Some(extension)
}

/// Removes the files left in the media directory after an abnormal shutdown.
/// Returns the number of removed files.
#[instrument]
pub(crate) async fn remove_stale_files(dir: &Path) -> Result<usize> {
    let mut entries = match fs_err::tokio::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        fs_err::tokio::remove_file(entry.path()).await?;
        removed += 1;
    }

    if removed > 0 {
        info!(removed, "Removed stale media files");
    }

    Ok(removed)
}
