use super::{DeserializeError, WatchMode};
use crate::prelude::*;
use crate::{err_ctx, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Channels watched in every mode. At most one of the lists is non-empty
/// when the state is written by us.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WatchState {
    #[serde(default)]
    pub(crate) watch: Vec<String>,

    #[serde(default)]
    pub(crate) watch_ai: Vec<String>,
}

impl WatchState {
    pub(crate) fn new(mode: WatchMode, channels: Vec<String>) -> Self {
        match mode {
            WatchMode::Plain => Self {
                watch: channels,
                watch_ai: vec![],
            },
            WatchMode::Ai => Self {
                watch: vec![],
                watch_ai: channels,
            },
        }
    }

    /// The watch that needs to be resumed. If both lists are filled (the file
    /// was edited manually) the AI watch wins.
    pub(crate) fn active(&self) -> Option<(WatchMode, &[String])> {
        if !self.watch_ai.is_empty() {
            if !self.watch.is_empty() {
                warn!(
                    ignored = ?self.watch,
                    "State contains both plain and AI watches, only the AI one is resumed"
                );
            }
            return Some((WatchMode::Ai, &self.watch_ai));
        }
        if !self.watch.is_empty() {
            return Some((WatchMode::Plain, &self.watch));
        }
        None
    }
}

/// Persists the [`WatchState`] in a JSON file
#[derive(Debug, Clone)]
pub(crate) struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Never fails. Missing or corrupt state file means there is nothing to resume.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub(crate) async fn load(&self) -> WatchState {
        match self.try_load().await {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!("State file doesn't exist, starting from scratch");
                WatchState::default()
            }
            Err(err) => {
                warn!(
                    err = tracing_err(&err),
                    "Failed to load the state, starting from scratch"
                );
                WatchState::default()
            }
        }
    }

    async fn try_load(&self) -> Result<Option<WatchState>> {
        let bytes = match fs_err::tokio::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(err_ctx!(DeserializeError::WatchState {
                path: self.path.clone()
            }))
    }

    /// Overwrites the previous state. The file is replaced atomically, so
    /// a crash in the middle of writing doesn't corrupt it.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub(crate) async fn save(&self, state: &WatchState) -> Result {
        let json = serde_json::to_vec_pretty(state)
            .fatal_ctx(|| format!("Failed to serialize the watch state {state:?}"))?;

        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .fatal_ctx(|| "The task that writes the state has panicked")??;

        debug!(?state, "Saved the watch state");

        Ok(())
    }

    pub(crate) async fn clear(&self) -> Result {
        self.save(&WatchState::default()).await
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> Result {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    fs_err::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .map_err(err_ctx!(crate::IoError::CreateTempFile))?;

    file.write_all(content)?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|err| err.error)?;

    Ok(())
}
