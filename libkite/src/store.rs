//! The job cursor: ids of jobs already handled by an earlier run.
//!
//! Stored as a JSON array of strings. A run reads it once at the start and
//! replaces it wholesale at the end.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tokio::fs;

use crate::api::JobId;
use crate::log::*;

pub type ProcessedJobSet = BTreeSet<JobId>;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("failed writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed serializing processed jobs: {0}")]
    Json(#[from] serde_json::Error),
    #[error("another run holds the lock on {0}")]
    Locked(PathBuf),
}

/// File-backed set of processed job ids.
#[derive(Debug, Clone)]
pub struct DedupStore {
    path: PathBuf,
}

/// Exclusive advisory lock held for the length of a run. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl DedupStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    /// Take the run lock without waiting. Fails with
    /// [`PersistError::Locked`] while another run is in progress.
    #[tracing::instrument(skip(self))]
    pub fn lock(&self) -> Result<RunLock, PersistError> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| PersistError::Io {
                path: path.clone(),
                source,
            })?;
        file.try_lock_exclusive()
            .map_err(|_| PersistError::Locked(path.clone()))?;
        debug!("acquired run lock {}", path.display());
        Ok(RunLock { file, path })
    }

    /// Read the set of processed ids. A missing or unreadable file is an
    /// empty set.
    #[tracing::instrument(skip(self))]
    pub async fn load(&self) -> ProcessedJobSet {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no job cursor at {}, starting empty", self.path.display());
                return ProcessedJobSet::new();
            }
            Err(e) => {
                warn!("could not read job cursor {}: {}", self.path.display(), e);
                return ProcessedJobSet::new();
            }
        };
        match serde_json::from_slice::<Vec<JobId>>(&raw) {
            Ok(ids) => {
                debug!("loaded {} processed job ids", ids.len());
                ids.into_iter().collect()
            }
            Err(e) => {
                warn!("job cursor {} is corrupt, starting empty: {}", self.path.display(), e);
                ProcessedJobSet::new()
            }
        }
    }

    /// Replace the stored set with `ids`. Written to a temp file first and
    /// renamed into place.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn save(&self, ids: &ProcessedJobSet) -> Result<(), PersistError> {
        let json = serde_json::to_vec(ids)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(io_error(parent))?;
            }
        }
        let tmp_path = sibling(&self.path, "tmp");
        fs::write(&tmp_path, &json).await.map_err(io_error(&tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(io_error(&self.path))?;
        debug!("saved {} processed job ids to {}", ids.len(), self.path.display());
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("failed releasing run lock {}: {}", self.path.display(), e);
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistError {
    let path = path.to_path_buf();
    move |source| PersistError::Io { path, source }
}

/// `kite.jobs.json` -> `kite.jobs.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}
