//! Shorthands for building the crate-level [`Error`](crate::Error) out of the
//! variants of the per-module error enums.

/// `err!(RelayError::ChatNotFound { identifier })` builds the variant with
/// every field converted via [`Into`] and wraps it into the crate-level error.
/// Field init shorthand is supported.
macro_rules! err {
    (@field $field:ident $value:expr) => ($value);
    (@field $field:ident) => ($field);
    ($($variant:ident)::+ $({ $($field:ident $(: $value:expr)?),* $(,)? })?) => {
        $crate::error::Error::from(
            $($variant)::+ $({$(
                $field: ::std::convert::Into::into(
                    $crate::error::err!(@field $field $($value)?)
                )
            ),*})?
        )
    };
}

/// `map_err(err_ctx!(HttpClientError::Request))` is the same as
/// `map_err(|source| err!(HttpClientError::Request { source }))`
macro_rules! err_ctx {
    ($($variant:ident)::+ $({ $($fields:tt)* })?) => {
        |source| $crate::error::err!($($variant)::+ { source, $($($fields)*)? })
    };
}

/// [`ErrorKind::Fatal`](crate::ErrorKind::Fatal) with a formatted message
/// and no source
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::Error::from($crate::ErrorKind::Fatal {
            message: ::std::format!($($arg)*),
            source: ::std::option::Option::None,
        })
    };
}

pub(crate) use err;
pub(crate) use err_ctx;
pub(crate) use fatal;
