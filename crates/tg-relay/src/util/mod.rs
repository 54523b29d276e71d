//! Assorted utility functions (missing batteries).
mod opaque;
mod std_ext;
mod teloxide_ext;

pub(crate) mod process;
pub(crate) mod retry;
pub(crate) mod size;

pub(crate) use opaque::Opaque;
pub(crate) use std_ext::*;

pub(crate) mod prelude {
    pub(crate) use super::std_ext::prelude::*;
    pub(crate) use super::teloxide_ext::prelude::*;
}

pub(crate) type DynResult<T = (), E = Box<DynError>> = std::result::Result<T, E>;
pub(crate) type DynError = dyn std::error::Error + Send + Sync;
