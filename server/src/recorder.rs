//! Turns filesystem observations into episodes and appends them to the graph.
//!
//! Every successful call performs exactly one append. Callers are expected to
//! log failures and keep going; see [`EpisodeRecorder::log_outcome`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::episode::{base_name, DirectoryEntity, Episode, FileEntity};
use crate::kg::GraphStore;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("graph store rejected episode for {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl RecorderError {
    pub fn path(&self) -> &Path {
        match self {
            RecorderError::Stat { path, .. } | RecorderError::Store { path, .. } => path,
        }
    }
}

pub struct EpisodeRecorder {
    store: Arc<dyn GraphStore>,
    retries: u32,
}

impl EpisodeRecorder {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store, retries: 0 }
    }

    /// Extra append attempts after a store failure, with linear backoff.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn record_file(&self, path: &Path, parent: &Path) -> Result<Episode, RecorderError> {
        let stat_err = |source| RecorderError::Stat { path: path.to_path_buf(), source };
        let meta = std::fs::metadata(path).map_err(stat_err)?;
        if !meta.is_file() {
            return Err(stat_err(std::io::Error::new(std::io::ErrorKind::Other, "not a regular file")));
        }
        let modified = meta.modified().map_err(stat_err)?;
        let entity = FileEntity {
            path: path.display().to_string(),
            name: base_name(path),
            size: meta.len(),
            modification_time: DateTime::<Utc>::from(modified),
            parent: parent.display().to_string(),
        };
        let episode = Episode::for_file(&entity).map_err(|e| self.store_err(path, e.into()))?;
        self.append(path, episode)
    }

    pub fn record_directory(&self, path: &Path, parent: Option<&Path>) -> Result<Episode, RecorderError> {
        let meta = std::fs::metadata(path).map_err(|source| RecorderError::Stat { path: path.to_path_buf(), source })?;
        if !meta.is_dir() {
            return Err(RecorderError::Stat {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            });
        }
        let entity = DirectoryEntity {
            path: path.display().to_string(),
            name: base_name(path),
            parent: parent.map(|p| p.display().to_string()),
        };
        let episode = Episode::for_directory(&entity).map_err(|e| self.store_err(path, e.into()))?;
        self.append(path, episode)
    }

    /// Record that `path` is gone. Never consults the filesystem.
    pub fn record_deletion(&self, path: &Path) -> Result<Episode, RecorderError> {
        let episode = Episode::for_deletion(path).map_err(|e| self.store_err(path, e.into()))?;
        self.append(path, episode)
    }

    fn append(&self, path: &Path, episode: Episode) -> Result<Episode, RecorderError> {
        let mut attempt = 0u32;
        loop {
            match self.store.append_episode(&episode) {
                Ok(seq) => {
                    info!(path = %path.display(), episode = %episode.name, seq, kind = episode.source_description(), "recorded episode");
                    return Ok(episode);
                }
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(path = %path.display(), attempt, error = %err, "graph store append failed, retrying");
                    std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                Err(err) => return Err(self.store_err(path, err)),
            }
        }
    }

    fn store_err(&self, path: &Path, source: anyhow::Error) -> RecorderError {
        RecorderError::Store { path: path.to_path_buf(), source }
    }

    /// Terminal handling for a recording result: failures end in a log line.
    pub fn log_outcome(result: Result<Episode, RecorderError>) -> Option<Episode> {
        match result {
            Ok(episode) => Some(episode),
            Err(err @ RecorderError::Stat { .. }) => {
                warn!(path = %err.path().display(), error = %err, "skipping entity that cannot be stat'd");
                None
            }
            Err(err @ RecorderError::Store { .. }) => {
                error!(path = %err.path().display(), error = %err, "dropping episode after store failure");
                None
            }
        }
    }
}
