//! Backends of the supported scheduler families.

mod common;
pub mod lsf;
pub mod pbs;
pub mod sge;
pub mod slurm;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, Resource};
use crate::remote::{RemoteError, RemoteExecutor};

pub use lsf::LsfBackend;
pub use pbs::PbsBackend;
pub use sge::SgeBackend;
pub use slurm::SlurmBackend;

#[derive(Serialize, Deserialize, clap::ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerFamily {
    Pbs,
    Lsf,
    Sge,
    Slurm,
}

impl SchedulerFamily {
    /// Order in which families are probed on a resource with an unknown scheduler.
    /// SGE has to be tried before PBS, since both provide `qsub`.
    pub const PROBE_ORDER: [SchedulerFamily; 4] = [
        SchedulerFamily::Lsf,
        SchedulerFamily::Sge,
        SchedulerFamily::Slurm,
        SchedulerFamily::Pbs,
    ];

    /// Command which succeeds only on resources running this family.
    pub fn detection_command(self) -> &'static str {
        match self {
            SchedulerFamily::Pbs => "qstat --version",
            SchedulerFamily::Lsf => "bsub -V",
            SchedulerFamily::Sge => "qconf -help",
            SchedulerFamily::Slurm => "sinfo --version",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SchedulerFamily::Pbs => "PBS",
            SchedulerFamily::Lsf => "LSF",
            SchedulerFamily::Sge => "SGE",
            SchedulerFamily::Slurm => "SLURM",
        }
    }

    pub fn script_name(self) -> &'static str {
        match self {
            SchedulerFamily::Pbs => "submit.pbs",
            SchedulerFamily::Lsf => "submit.lsf",
            SchedulerFamily::Sge => "submit.sge",
            SchedulerFamily::Slurm => "submit.slurm",
        }
    }
}

impl Display for SchedulerFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Job state as reported by a scheduler listing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RawState {
    Held,
    Queued,
    Running,
    /// The job is no longer present in the listing.
    Finished,
}

/// Expected outcomes of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(String),
    /// The scheduler refused the job because of a per-user limit of jobs.
    AdmissionExhausted,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("Submission of job `{job}` failed: {diagnosis}\n{output}")]
    Submission {
        job: String,
        diagnosis: String,
        output: String,
    },
    #[error("Unexpected {family} response: {message}")]
    MalformedResponse {
        family: SchedulerFamily,
        message: String,
    },
    #[error("Job `{0}` does not have a remote job id")]
    MissingRemoteId(String),
    #[error("Cannot write submission script {path}: {source}")]
    ScriptIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{family} backend does not support `{capability}`")]
    CapabilityMissing {
        family: SchedulerFamily,
        capability: &'static str,
    },
}

impl BackendError {
    pub fn is_capability_missing(&self) -> bool {
        matches!(self, BackendError::CapabilityMissing { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = BackendResult<T>> + 'a>>;

/// Communicates with the scheduler of a resource.
pub trait SchedulerBackend {
    fn family(&self) -> SchedulerFamily;

    /// Renders the contents of the submission script of the job.
    fn build_submission_script(&self, job: &Job, resource: &Resource) -> BackendResult<String>;

    /// Submits the job from its remote working directory.
    fn submit<'a>(&'a self, job: &'a Job, resource: &'a Resource)
    -> BackendFuture<'a, SubmitOutcome>;

    /// Finds the job in the listing of the user's jobs.
    fn status<'a>(&'a self, job: &'a Job, resource: &'a Resource) -> BackendFuture<'a, RawState>;

    /// Cancels the job. A job that is already gone is not an error.
    fn delete<'a>(&'a self, _job: &'a Job, _resource: &'a Resource) -> BackendFuture<'a, ()> {
        let family = self.family();
        Box::pin(async move {
            Err(BackendError::CapabilityMissing {
                family,
                capability: "delete",
            })
        })
    }
}

/// Writes the submission script into the local directory of the job and adds it to the
/// upload manifest.
pub fn prepare_submission_script(
    backend: &dyn SchedulerBackend,
    job: &mut Job,
    resource: &Resource,
) -> BackendResult<PathBuf> {
    let script = backend.build_submission_script(job, resource)?;
    let script_name = backend.family().script_name();
    let path = job.local_workdir.join(script_name);
    std::fs::write(&path, script).map_err(|source| BackendError::ScriptIo {
        path: path.clone(),
        source,
    })?;
    if !job.upload.include.is_empty() {
        job.upload.add_include(script_name.to_string());
    }
    job.script_path = Some(path.clone());
    Ok(path)
}

pub fn create_backend(
    family: SchedulerFamily,
    executor: Rc<RemoteExecutor>,
) -> Rc<dyn SchedulerBackend> {
    match family {
        SchedulerFamily::Pbs => Rc::new(PbsBackend::new(executor)),
        SchedulerFamily::Lsf => Rc::new(LsfBackend::new(executor)),
        SchedulerFamily::Sge => Rc::new(SgeBackend::new(executor)),
        SchedulerFamily::Slurm => Rc::new(SlurmBackend::new(executor)),
    }
}

/// Finds out which scheduler family runs on the resource by trying the detection command
/// of each family.
pub async fn probe_family(
    executor: &RemoteExecutor,
    resource: &Resource,
) -> BackendResult<Option<SchedulerFamily>> {
    for family in SchedulerFamily::PROBE_ORDER {
        match executor
            .execute(resource, &[family.detection_command().to_string()])
            .await
        {
            Ok(_) => {
                log::info!("Detected {family} scheduler on resource `{}`", resource.name);
                return Ok(Some(family));
            }
            Err(RemoteError::Execution { exit_code, .. })
                if exit_code != crate::engine::config::SSH_TRANSPORT_FAULT =>
            {
                log::debug!("Resource `{}` does not run {family}", resource.name);
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use crate::scheduler::{prepare_submission_script, probe_family, PbsBackend, SchedulerFamily};
    use crate::tests::utils::{job, resource, ScriptedRunner};
    use std::rc::Rc;

    #[tokio::test]
    async fn probe_stops_at_first_success() {
        let runner = ScriptedRunner::new(vec![(127, String::new()), (0, String::new())]);
        let executor = runner.executor();
        let family = probe_family(&executor, &resource("cluster")).await.unwrap();
        assert_eq!(family, Some(SchedulerFamily::Sge));
        let commands: Vec<String> = runner
            .calls()
            .into_iter()
            .map(|(_, args)| args.last().cloned().unwrap())
            .collect();
        assert_eq!(commands, vec!["bsub -V", "qconf -help"]);
    }

    #[tokio::test]
    async fn probe_without_scheduler() {
        let runner = ScriptedRunner::new(vec![(127, String::new()); 4]);
        let executor = runner.executor();
        assert_eq!(
            probe_family(&executor, &resource("cluster")).await.unwrap(),
            None
        );
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn probe_fails_on_connection_error() {
        let runner = ScriptedRunner::new(vec![(255, String::new()); 3]);
        let executor = runner.executor();
        assert!(probe_family(&executor, &resource("cluster")).await.is_err());
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn prepare_script_writes_file() {
        let dir = tempfile::TempDir::with_prefix("hpcb").unwrap();
        let runner = ScriptedRunner::new(vec![]);
        let backend = PbsBackend::new(Rc::new(runner.executor()));
        let resource = resource("cluster");
        let mut job = job("md");
        job.local_workdir = dir.path().to_path_buf();
        job.upload.include = vec!["*.in".to_string()];

        let path = prepare_submission_script(&backend, &mut job, &resource).unwrap();
        assert_eq!(path, dir.path().join("submit.pbs"));
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .starts_with("#!/bin/bash --login"));
        assert_eq!(job.upload.include, vec!["*.in", "submit.pbs"]);
        assert_eq!(job.script_path, Some(path.clone()));

        prepare_submission_script(&backend, &mut job, &resource).unwrap();
        assert_eq!(job.upload.include, vec!["*.in", "submit.pbs"]);
    }

    #[test]
    fn prepare_script_keeps_unfiltered_upload() {
        let dir = tempfile::TempDir::with_prefix("hpcb").unwrap();
        let backend = PbsBackend::new(Rc::new(ScriptedRunner::new(vec![]).executor()));
        let mut job = job("md");
        job.local_workdir = dir.path().to_path_buf();
        prepare_submission_script(&backend, &mut job, &resource("cluster")).unwrap();
        assert!(job.upload.include.is_empty());
    }
}
