mod ext;
mod macros;

use crate::prelude::*;
use crate::util::DynError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing_error::SpanTrace;

pub(crate) use macros::*;

pub(crate) mod prelude {
    pub(crate) use super::ext::{OptionExt as _, ResultExt as _};
}

pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Any error of the relay. Cheap to clone, the same error may be reported
/// to the chat and written to the logs.
#[derive(Clone)]
pub struct Error {
    imp: Arc<ErrorImp>,
}

struct ErrorImp {
    /// Short random tag printed together with the error, it links the
    /// chat reply to the log records of the same failure
    id: String,
    kind: ErrorKind,
    spantrace: SpanTrace,
}

#[derive(Error, Debug)]
pub(crate) enum ErrorKind {
    #[error(transparent)]
    Command {
        #[from]
        source: crate::tg::CommandError,
    },

    #[error(transparent)]
    Relay {
        #[from]
        source: crate::relay::RelayError,
    },

    #[error(transparent)]
    Llm {
        #[from]
        source: crate::llm::LlmError,
    },

    #[error(transparent)]
    Transcode {
        #[from]
        source: crate::media::TranscodeError,
    },

    #[error(transparent)]
    Filter {
        #[from]
        source: crate::filter::FilterRulesError,
    },

    #[error(transparent)]
    HttpClient {
        #[from]
        source: crate::http::HttpClientError,
    },

    #[error(transparent)]
    Tg {
        #[from]
        source: teloxide::RequestError,
    },

    #[error(transparent)]
    TgClient {
        #[from]
        source: crate::tg::TgClientError,
    },

    #[error(transparent)]
    Deserialize {
        #[from]
        source: crate::relay::DeserializeError,
    },

    #[error(transparent)]
    Io {
        #[from]
        source: IoError,
    },

    /// Broken invariant or an unexpected environment state. Nothing handles
    /// it specifically, it just bubbles up.
    #[error("FATAL: {message}")]
    Fatal {
        message: String,
        source: Option<Box<DynError>>,
    },
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io { source: err.into() }
    }
}

#[derive(Debug, Error)]
pub(crate) enum IoError {
    #[error("Failed to create a temporary file")]
    CreateTempFile { source: std::io::Error },

    #[error(transparent)]
    Other {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn id(&self) -> &str {
        &self.imp.id
    }

    /// The owner made a mistake in a command or named a chat that can't be
    /// used. Such errors are logged at a lower level.
    pub(crate) fn is_user_error(&self) -> bool {
        match &self.imp.kind {
            ErrorKind::Command { .. } => true,
            ErrorKind::Relay { source } => source.is_user_error(),
            _ => false,
        }
    }

    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.imp.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.imp.id, self.imp.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.imp.kind.source()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}\n{}", self.imp.spantrace)
    }
}

impl<T: Into<ErrorKind>> From<T> for Error {
    #[track_caller]
    fn from(kind: T) -> Self {
        let err = Self {
            imp: Arc::new(ErrorImp {
                id: nanoid::nanoid!(6),
                kind: kind.into(),
                spantrace: SpanTrace::capture(),
            }),
        };

        trace!(err = tracing_err(&err), "Error created");

        err
    }
}
