//! Job files: TOML descriptions of resources and the jobs submitted to them.
//!
//! ```toml
//! [resources.cluster]
//! host = "login.cluster.org"
//! user = "jdoe"
//! remote_workdir = "/scratch/jdoe"
//!
//! [[job]]
//! name = "md"
//! resource = "cluster"
//! executable = "pmemd.MPI"
//! cores = 48
//! walltime = "12:00:00"
//! upload_include = "*.in, *.prmtop"
//! ```
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::common::error::HpcError;
use crate::common::fsutils::expand_home;
use crate::common::serialization::human_duration;
use crate::common::strutils::split_manifest;
use crate::job::{FileManifest, Job, Resource, Status};
use crate::scheduler::SchedulerFamily;
use crate::{ResourceId, Set};

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_WALLTIME: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_one() -> u32 {
    1
}

fn default_walltime() -> Duration {
    DEFAULT_WALLTIME
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ResourceDef {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub identity: Option<PathBuf>,

    /// Detected on the first connection when not set.
    #[serde(default)]
    pub scheduler: Option<SchedulerFamily>,

    #[serde(default)]
    pub handler: Option<String>,

    #[serde(default = "default_one")]
    pub cores_per_node: u32,

    pub remote_workdir: String,

    #[serde(default)]
    pub account_flag: Option<String>,

    #[serde(default)]
    pub parallel_environment: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobDef {
    pub name: String,

    pub resource: ResourceId,

    /// Relative paths are resolved against the directory of the job file.
    /// Defaults to a directory named after the job.
    #[serde(default)]
    pub local_workdir: Option<PathBuf>,

    pub executable: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub handler: Option<String>,

    #[serde(default = "default_one")]
    pub cores: u32,

    #[serde(default)]
    pub cores_per_node: Option<u32>,

    #[serde(default = "default_one")]
    pub replicates: u32,

    #[serde(default = "default_walltime")]
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub walltime: Duration,

    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub memory_gb: Option<u32>,

    #[serde(default)]
    pub email_address: Option<String>,

    #[serde(default)]
    pub email_flags: Option<String>,

    #[serde(default)]
    pub modules: Vec<String>,

    #[serde(default)]
    pub scripts: Vec<String>,

    #[serde(default = "default_interval")]
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub poll_interval: Duration,

    #[serde(default = "default_interval")]
    #[serde(deserialize_with = "human_duration::deserialize")]
    pub staging_interval: Duration,

    #[serde(default)]
    pub upload_include: String,

    #[serde(default)]
    pub upload_exclude: String,

    #[serde(default)]
    pub download_include: String,

    #[serde(default)]
    pub download_exclude: String,
}

impl JobDef {
    fn validate(&self, resources: &BTreeMap<ResourceId, ResourceDef>) -> crate::Result<()> {
        let invalid = |message: String| {
            Err(HpcError::InvalidJobDefinition(format!(
                "Job `{}`: {message}",
                self.name
            )))
        };

        if self.name.is_empty() || self.name.contains(|c: char| c.is_whitespace() || c == '/') {
            return invalid("name must be non-empty and contain no whitespace or `/`".into());
        }
        if !resources.contains_key(&self.resource) {
            return invalid(format!("unknown resource `{}`", self.resource));
        }
        if self.executable.trim().is_empty() {
            return invalid("executable must not be empty".into());
        }
        if self.cores == 0 {
            return invalid("`cores` must be at least 1".into());
        }
        if self.cores_per_node == Some(0) {
            return invalid("`cores_per_node` must be at least 1".into());
        }
        if self.replicates == 0 {
            return invalid("`replicates` must be at least 1".into());
        }
        if self.walltime.is_zero() {
            return invalid("`walltime` must not be zero".into());
        }
        Ok(())
    }

    fn into_job(self, base_dir: &Path) -> Job {
        let local_workdir = match self.local_workdir {
            Some(path) => base_dir.join(expand_home(&path)),
            None => base_dir.join(&self.name),
        };
        Job {
            name: self.name,
            resource: self.resource,
            local_workdir,
            remote_dir_name: String::new(),
            executable: self.executable,
            arguments: self.arguments,
            handler: self.handler,
            cores: self.cores,
            cores_per_node: self.cores_per_node,
            replicates: self.replicates,
            walltime: self.walltime,
            queue: self.queue,
            account: self.account,
            memory_gb: self.memory_gb,
            email_address: self.email_address,
            email_flags: self.email_flags,
            modules: self.modules,
            scripts: self.scripts,
            poll_interval: self.poll_interval,
            staging_interval: self.staging_interval,
            status: Status::Prepared,
            remote_id: None,
            script_path: None,
            staged: false,
            last_error: None,
            error_count: 0,
            upload: FileManifest {
                include: split_manifest(&self.upload_include),
                exclude: split_manifest(&self.upload_exclude),
            },
            download: FileManifest {
                include: split_manifest(&self.download_include),
                exclude: split_manifest(&self.download_exclude),
            },
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceDef>,

    #[serde(default)]
    #[serde(rename = "job")]
    pub jobs: Vec<JobDef>,
}

impl JobFile {
    pub fn parse(text: &str) -> crate::Result<JobFile> {
        let file: JobFile = toml::from_str(text)?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> crate::Result<JobFile> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            HpcError::GenericError(format!("Cannot read job file {}: {error}", path.display()))
        })?;
        Self::parse(&text)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.jobs.is_empty() {
            return Err(HpcError::DeserializationError("No jobs defined".into()));
        }
        for (name, resource) in &self.resources {
            if resource.host.is_empty() || resource.user.is_empty() {
                return Err(HpcError::InvalidJobDefinition(format!(
                    "Resource `{name}` needs both `host` and `user`"
                )));
            }
            if resource.remote_workdir.trim().is_empty() {
                return Err(HpcError::InvalidJobDefinition(format!(
                    "Resource `{name}` needs a `remote_workdir`"
                )));
            }
            if resource.cores_per_node == 0 {
                return Err(HpcError::InvalidJobDefinition(format!(
                    "Resource `{name}`: `cores_per_node` must be at least 1"
                )));
            }
        }

        let mut names = Set::default();
        for job in &self.jobs {
            job.validate(&self.resources)?;
            if !names.insert(job.name.as_str()) {
                return Err(HpcError::InvalidJobDefinition(format!(
                    "Job name `{}` is used more than once",
                    job.name
                )));
            }
        }
        Ok(())
    }

    /// Converts the definitions into resources and jobs ready for the engine.
    /// Local paths are resolved against `base_dir`.
    pub fn into_parts(self, base_dir: &Path) -> (Vec<Resource>, Vec<Job>) {
        let resources = self
            .resources
            .into_iter()
            .map(|(name, def)| Resource {
                name,
                host: def.host,
                port: def.port,
                user: def.user,
                identity: def.identity.map(|path| expand_home(&path)),
                scheduler: def.scheduler,
                handler: def.handler,
                cores_per_node: def.cores_per_node,
                remote_workdir: def.remote_workdir,
                account_flag: def.account_flag,
                parallel_environment: def.parallel_environment,
            })
            .collect();
        let jobs = self
            .jobs
            .into_iter()
            .map(|def| def.into_job(base_dir))
            .collect();
        (resources, jobs)
    }
}
