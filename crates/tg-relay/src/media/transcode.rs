use super::Dimensions;
use crate::observability::metrics::MEDIA_TRANSCODE_DURATION_SECONDS;
use crate::prelude::*;
use crate::util::process::{self, ProcessError};
use crate::{err, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TranscodeError {
    #[error("Video encoder failed to convert {input}")]
    EncoderFailed { input: String, source: ProcessError },

    #[error("Video encoder didn't convert {input} in {timeout:.2?}")]
    Timeout { input: String, timeout: Duration },
}

/// Converts videos into the format that Telegram can stream
#[async_trait]
pub(crate) trait Transcoder: Send + Sync {
    async fn to_mp4(&self, input: &Path, output: &Path, dimensions: Dimensions) -> Result;
}

pub(crate) struct FfmpegTranscoder {
    pub(crate) timeout: Duration,
}

// Rustfmt is doing a bad job of condensing this code, so let's disable it
#[rustfmt::skip]
const H264_AAC_ARGS: &[&str] = &[
    "-c:v",
    "libx264",

    "-c:a",
    "aac",

    // Fast start is needed to make the video playable before it's fully downloaded
    "-movflags",
    "+faststart",
];

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[instrument(skip_all, fields(input = %input.display(), %dimensions))]
    async fn to_mp4(&self, input: &Path, output: &Path, dimensions: Dimensions) -> Result {
        let input_arg = input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let scale = format!("scale={}:{}", dimensions.width, dimensions.height);

        #[rustfmt::skip]
        let args = [
            &[
                // Overwrite output file without interactive confirmation
                "-y",
                "-i",
                &input_arg,
                "-vf",
                &scale,
            ],
            H264_AAC_ARGS,
            &[&output_arg],
        ]
        .concat();

        let (result, duration) = process::run("ffmpeg", &args, Some(self.timeout))
            .timed()
            .await;

        metrics::histogram!(MEDIA_TRANSCODE_DURATION_SECONDS).record(duration);

        let duration = tracing_duration(duration);

        match result {
            Ok(_) => {
                info!(duration, "Converted video to mp4");
                Ok(())
            }
            Err(ProcessError::Timeout { timeout, .. }) => {
                warn!(duration, "Video conversion timed out");
                Err(err!(TranscodeError::Timeout {
                    input: input_arg.into_owned(),
                    timeout,
                }))
            }
            Err(source) => {
                warn!(duration, "Video conversion failed");
                Err(err!(TranscodeError::EncoderFailed {
                    input: input_arg.into_owned(),
                    source,
                }))
            }
        }
    }
}
