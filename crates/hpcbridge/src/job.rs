//! Job and resource records together with the job lifecycle state machine.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::fsutils::join_remote_path;
use crate::common::serialization::human_duration;
use crate::common::strutils::random_suffix;
use crate::engine::config::REMOTE_DIR_SUFFIX_LENGTH;
use crate::scheduler::{RawState, SchedulerFamily};
use crate::ResourceId;

/// Lifecycle of a single job.
///
/// `Prepared → Staged → Submitted → {Queued, Held} → Running → Finished → Complete`,
/// with `SubmitError` (terminal) and `WaitingAdmission` (deferred submission) as
/// escape states.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Prepared,
    Staged,
    Submitted,
    Queued,
    Held,
    Running,
    Finished,
    Complete,
    SubmitError,
    WaitingAdmission,
}

impl Status {
    /// Translates a state reported by the scheduler into the next job status.
    pub fn next(self, raw: RawState) -> Status {
        match (self, raw) {
            (Status::Queued | Status::Held | Status::Running, RawState::Finished) => {
                Status::Finished
            }
            // Some schedulers cache the queue listing, so a started job may be
            // reported as queued for a little while.
            (Status::Running, RawState::Queued) => Status::Running,
            (Status::Queued | Status::Held | Status::Running, RawState::Running) => {
                Status::Running
            }
            (Status::Queued | Status::Held, RawState::Queued) => Status::Queued,
            (Status::Queued | Status::Held | Status::Running, RawState::Held) => Status::Held,
            (
                Status::Prepared
                | Status::Staged
                | Status::Submitted
                | Status::Finished
                | Status::Complete
                | Status::SubmitError
                | Status::WaitingAdmission,
                _,
            ) => self,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::SubmitError)
    }

    /// The job is known to the scheduler and its state should be polled.
    pub fn is_pollable(self) -> bool {
        matches!(self, Status::Queued | Status::Held | Status::Running)
    }

    /// The job occupies a slot of its resource.
    pub fn holds_slot(self) -> bool {
        self.is_pollable()
    }

    /// Statuses which imply that the scheduler assigned an identifier to the job.
    pub fn has_remote_id(self) -> bool {
        matches!(
            self,
            Status::Queued | Status::Held | Status::Running | Status::Finished | Status::Complete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Prepared => "PREPARED",
            Status::Staged => "STAGED",
            Status::Submitted => "SUBMITTED",
            Status::Queued => "QUEUED",
            Status::Held => "HELD",
            Status::Running => "RUNNING",
            Status::Finished => "FINISHED",
            Status::Complete => "COMPLETE",
            Status::SubmitError => "SUBMIT ERROR",
            Status::WaitingAdmission => "WAITING ADMISSION",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Include/exclude patterns of a file transfer.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct FileManifest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl FileManifest {
    pub fn add_include(&mut self, pattern: String) {
        if !self.include.contains(&pattern) {
            self.include.push(pattern);
        }
    }
}

/// A remote HPC endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: ResourceId,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: Option<PathBuf>,
    /// `None` until the family is configured or probed.
    pub scheduler: Option<SchedulerFamily>,
    /// Launcher of the executable (`mpirun`, `aprun`, ...).
    pub handler: Option<String>,
    pub cores_per_node: u32,
    /// Base directory under which private job directories are created.
    pub remote_workdir: String,
    /// Overrides the flag used to pass the account (`-A` for PBS, `--account` for SLURM).
    pub account_flag: Option<String>,
    /// SGE parallel environment name.
    pub parallel_environment: Option<String>,
}

impl Resource {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// One unit of work targeting a single resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub resource: ResourceId,
    pub local_workdir: PathBuf,
    /// Name of the private directory under the resource's base directory.
    pub remote_dir_name: String,

    pub executable: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// Overrides the launcher of the resource.
    pub handler: Option<String>,
    pub cores: u32,
    pub cores_per_node: Option<u32>,
    pub replicates: u32,
    #[serde(with = "human_duration")]
    pub walltime: Duration,
    pub queue: Option<String>,
    pub account: Option<String>,
    pub memory_gb: Option<u32>,
    pub email_address: Option<String>,
    pub email_flags: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
    /// Shell snippets inserted before the launch line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<String>,

    #[serde(with = "human_duration")]
    pub poll_interval: Duration,
    #[serde(with = "human_duration")]
    pub staging_interval: Duration,

    pub status: Status,
    pub remote_id: Option<String>,
    pub script_path: Option<PathBuf>,
    /// Files were pushed to the remote directory, so it has to be cleaned up.
    #[serde(default)]
    pub staged: bool,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub error_count: u32,

    #[serde(default)]
    pub upload: FileManifest,
    #[serde(default)]
    pub download: FileManifest,
}

impl Job {
    pub fn remote_workdir(&self, resource: &Resource) -> String {
        join_remote_path(&resource.remote_workdir, &self.remote_dir_name)
    }

    /// Generates a fresh private directory name for a new submission attempt.
    pub fn assign_remote_dir_name(&mut self) {
        self.remote_dir_name = format!("{}{}", self.name, random_suffix(REMOTE_DIR_SUFFIX_LENGTH));
    }

    pub fn cores_per_node(&self, resource: &Resource) -> u32 {
        self.cores_per_node.unwrap_or(resource.cores_per_node)
    }

    pub fn handler<'a>(&'a self, resource: &'a Resource) -> Option<&'a str> {
        self.handler
            .as_deref()
            .or(resource.handler.as_deref())
            .filter(|handler| !handler.is_empty())
    }

    pub fn is_array(&self) -> bool {
        self.replicates > 1
    }

    pub fn replicate_dirs(&self) -> Vec<String> {
        if self.is_array() {
            (1..=self.replicates).map(|index| format!("rep{index}")).collect()
        } else {
            vec![]
        }
    }

    pub fn mark_submitted(&mut self, remote_id: String) {
        self.remote_id = Some(remote_id);
        self.status = Status::Queued;
        self.reset_errors();
    }

    /// Returns the job into a state from which it can be prepared again.
    pub fn reset_for_preparation(&mut self) {
        self.status = Status::Prepared;
        self.remote_id = None;
    }

    pub fn record_error(&mut self, message: String) -> u32 {
        self.last_error = Some(message);
        self.error_count += 1;
        self.error_count
    }

    pub fn reset_errors(&mut self) {
        self.error_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use crate::job::Status;
    use crate::scheduler::RawState;
    use crate::tests::utils::{job, resource};

    const ALL_STATUSES: [Status; 10] = [
        Status::Prepared,
        Status::Staged,
        Status::Submitted,
        Status::Queued,
        Status::Held,
        Status::Running,
        Status::Finished,
        Status::Complete,
        Status::SubmitError,
        Status::WaitingAdmission,
    ];
    const ALL_RAW: [RawState; 4] = [
        RawState::Held,
        RawState::Queued,
        RawState::Running,
        RawState::Finished,
    ];

    #[test]
    fn follows_scheduler_state() {
        assert_eq!(Status::Queued.next(RawState::Running), Status::Running);
        assert_eq!(Status::Queued.next(RawState::Held), Status::Held);
        assert_eq!(Status::Held.next(RawState::Queued), Status::Queued);
        assert_eq!(Status::Running.next(RawState::Finished), Status::Finished);
        assert_eq!(Status::Queued.next(RawState::Finished), Status::Finished);
    }

    #[test]
    fn running_job_reported_as_queued_stays_running() {
        assert_eq!(Status::Running.next(RawState::Queued), Status::Running);
    }

    #[test]
    fn finished_only_from_known_job() {
        for status in ALL_STATUSES {
            for raw in ALL_RAW {
                let next = status.next(raw);
                if next == Status::Finished && status != Status::Finished {
                    assert!(matches!(
                        status,
                        Status::Queued | Status::Running | Status::Held
                    ));
                }
            }
        }
    }

    #[test]
    fn inactive_statuses_ignore_scheduler() {
        for status in [
            Status::Prepared,
            Status::Staged,
            Status::Submitted,
            Status::Finished,
            Status::Complete,
            Status::SubmitError,
            Status::WaitingAdmission,
        ] {
            for raw in ALL_RAW {
                assert_eq!(status.next(raw), status);
            }
        }
    }

    #[test]
    fn complete_never_reached_by_polling() {
        for status in ALL_STATUSES {
            for raw in ALL_RAW {
                let next = status.next(raw);
                assert!(next != Status::Complete || status == Status::Complete);
            }
        }
    }

    #[test]
    fn remote_dir_name_is_unique() {
        let mut job = job("md");
        job.assign_remote_dir_name();
        let first = job.remote_dir_name.clone();
        job.assign_remote_dir_name();
        assert!(first.starts_with("md"));
        assert_eq!(first.len(), 7);
        assert_ne!(first, job.remote_dir_name);
    }

    #[test]
    fn remote_workdir_under_base() {
        let resource = resource("cluster");
        let mut job = job("md");
        job.remote_dir_name = "mdabcde".to_string();
        assert_eq!(job.remote_workdir(&resource), "/scratch/user/mdabcde");
        job.remote_dir_name = String::new();
        assert_eq!(job.remote_workdir(&resource), "/scratch/user");
    }

    #[test]
    fn replicate_directories() {
        let mut job = job("md");
        assert!(job.replicate_dirs().is_empty());
        job.replicates = 3;
        assert_eq!(job.replicate_dirs(), vec!["rep1", "rep2", "rep3"]);
    }

    #[test]
    fn job_handler_overrides_resource() {
        let mut resource = resource("cluster");
        resource.handler = Some("mpirun".to_string());
        let mut job = job("md");
        assert_eq!(job.handler(&resource), Some("mpirun"));
        job.handler = Some("aprun".to_string());
        assert_eq!(job.handler(&resource), Some("aprun"));
        job.handler = Some(String::new());
        assert_eq!(job.handler(&resource), None);
    }
}
