//! Transfers of job files between the local and the remote working directory.

use std::rc::Rc;

use thiserror::Error;

use crate::common::fsutils::normalize_remote_path;
use crate::job::{Job, Resource};
use crate::remote::{RemoteError, RemoteExecutor, TransferDirection};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Cannot prepare remote directory of job `{job}`: {source}")]
    Prepare { job: String, source: RemoteError },
    #[error("Cannot transfer files of job `{job}`: {source}")]
    Transfer { job: String, source: RemoteError },
    #[error("Cannot remove remote directory of job `{job}`: {source}")]
    Cleanup { job: String, source: RemoteError },
    #[error("Remote directory `{path}` of job `{job}` is the base directory of its resource")]
    UnsafeDirectory { job: String, path: String },
}

pub type StagingResult<T> = Result<T, StagingError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    /// The job directory is the shared base directory, nothing was removed.
    Refused,
}

/// Is the private directory of the job the shared base directory of its resource?
fn is_base_directory(job: &Job, resource: &Resource) -> bool {
    normalize_remote_path(&job.remote_workdir(resource))
        == normalize_remote_path(&resource.remote_workdir)
}

pub struct StagingCoordinator {
    executor: Rc<RemoteExecutor>,
}

impl StagingCoordinator {
    pub fn new(executor: Rc<RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Recreates an empty remote directory of the job and uploads its input files.
    ///
    /// A stale directory with the same name is removed first, so calling this repeatedly
    /// leaves the same set of files on the resource.
    pub async fn push_initial(&self, job: &Job, resource: &Resource) -> StagingResult<()> {
        let directory = job.remote_workdir(resource);
        if is_base_directory(job, resource) {
            return Err(StagingError::UnsafeDirectory {
                job: job.name.clone(),
                path: directory,
            });
        }

        let mut mkdir = format!("mkdir -p {directory}");
        for subdirectory in job.replicate_dirs() {
            mkdir.push_str(&format!(" {directory}/{subdirectory}"));
        }
        self.executor
            .execute(resource, &[format!("rm -rf {directory}"), mkdir])
            .await
            .map_err(|source| StagingError::Prepare {
                job: job.name.clone(),
                source,
            })?;

        log::debug!(
            "Uploading files of job `{}` to {}:{directory}",
            job.name,
            resource.host
        );
        self.executor
            .transfer(
                resource,
                &job.local_workdir,
                &directory,
                &job.upload,
                TransferDirection::Upload,
            )
            .await
            .map_err(|source| StagingError::Transfer {
                job: job.name.clone(),
                source,
            })
    }

    /// Downloads the current results of a job. Safe to call repeatedly.
    pub async fn pull_incremental(&self, job: &Job, resource: &Resource) -> StagingResult<()> {
        log::debug!("Downloading results of job `{}`", job.name);
        self.download(job, resource).await
    }

    /// Downloads the results of a job which has left the queue.
    pub async fn pull_final(&self, job: &Job, resource: &Resource) -> StagingResult<()> {
        log::info!("Downloading final results of job `{}`", job.name);
        self.download(job, resource).await
    }

    async fn download(&self, job: &Job, resource: &Resource) -> StagingResult<()> {
        self.executor
            .transfer(
                resource,
                &job.local_workdir,
                &job.remote_workdir(resource),
                &job.download,
                TransferDirection::Download,
            )
            .await
            .map_err(|source| StagingError::Transfer {
                job: job.name.clone(),
                source,
            })
    }

    /// Removes the remote directory of the job, unless it is the base directory of the
    /// resource.
    pub async fn cleanup(&self, job: &Job, resource: &Resource) -> StagingResult<CleanupOutcome> {
        let directory = job.remote_workdir(resource);
        if is_base_directory(job, resource) {
            log::warn!(
                "Remote directory `{directory}` of job `{}` is the base directory of resource `{}`, it will not be removed",
                job.name,
                resource.name
            );
            return Ok(CleanupOutcome::Refused);
        }
        self.executor
            .execute(resource, &[format!("rm -rf {directory}")])
            .await
            .map_err(|source| StagingError::Cleanup {
                job: job.name.clone(),
                source,
            })?;
        log::debug!("Removed remote directory `{directory}` of job `{}`", job.name);
        Ok(CleanupOutcome::Removed)
    }
}
