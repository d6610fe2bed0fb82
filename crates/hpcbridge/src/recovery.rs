//! Persistence of the engine state, allowing to resume monitoring of submitted jobs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::AdmissionState;
use crate::job::{Job, Resource};
use crate::ResourceId;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Cannot access recovery file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot serialize recovery snapshot: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Cannot parse recovery file {path}: {source}")]
    Deserialize {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Recovery file {path} has version {found}, expected {SNAPSHOT_VERSION}")]
    Version { path: PathBuf, found: u32 },
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    pub resource: Resource,
    #[serde(default)]
    pub admission: AdmissionState,
}

/// Point in time copy of all jobs and resources of an engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecoverySnapshot {
    pub version: u32,
    pub written_at: DateTime<Utc>,
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl RecoverySnapshot {
    pub fn new(resources: BTreeMap<ResourceId, ResourceRecord>, jobs: Vec<Job>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            written_at: Utc::now(),
            resources,
            jobs,
        }
    }
}

/// Recovery file on the local disk.
///
/// Each write replaces the whole file atomically. The file is never removed
/// automatically.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    path: PathBuf,
}

impl RecoveryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, snapshot: &RecoverySnapshot) -> RecoveryResult<()> {
        let content = toml::to_string_pretty(snapshot)?;
        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_error = |source| RecoveryError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = tempfile::NamedTempFile::new_in(&directory).map_err(io_error)?;
        file.write_all(content.as_bytes()).map_err(io_error)?;
        file.persist(&self.path)
            .map_err(|error| io_error(error.error))?;
        log::debug!("Recovery snapshot written to {}", self.path.display());
        Ok(())
    }

    pub fn load(&self) -> RecoveryResult<RecoverySnapshot> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| RecoveryError::Io {
            path: self.path.clone(),
            source,
        })?;
        let snapshot: RecoverySnapshot =
            toml::from_str(&content).map_err(|source| RecoveryError::Deserialize {
                path: self.path.clone(),
                source,
            })?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(RecoveryError::Version {
                path: self.path.clone(),
                found: snapshot.version,
            });
        }
        Ok(snapshot)
    }
}
