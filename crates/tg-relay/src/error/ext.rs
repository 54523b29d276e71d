use super::{Error, ErrorKind, Result};
use crate::util::DynError;
use easy_ext::ext;

#[ext(ResultExt)]
pub(crate) impl<T, E> std::result::Result<T, E>
where
    E: Into<Box<DynError>>,
{
    /// Converts the error into [`ErrorKind::Fatal`], the original error
    /// becomes its source
    #[track_caller]
    fn fatal_ctx<M: Into<String>>(self, message: impl FnOnce() -> M) -> Result<T> {
        // `match` instead of `map_err`, `#[track_caller]` doesn't see through closures
        match self {
            Ok(value) => Ok(value),
            Err(source) => Err(fatal_error(message().into(), Some(source.into()))),
        }
    }
}

#[ext(OptionExt)]
pub(crate) impl<T> Option<T> {
    /// `None` is an invariant violation
    #[track_caller]
    fn fatal_ctx<M: Into<String>>(self, message: impl FnOnce() -> M) -> Result<T> {
        match self {
            Some(value) => Ok(value),
            None => Err(fatal_error(message().into(), None)),
        }
    }
}

#[track_caller]
fn fatal_error(message: String, source: Option<Box<DynError>>) -> Error {
    Error::from(ErrorKind::Fatal { message, source })
}
