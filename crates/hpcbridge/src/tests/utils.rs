use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use derive_builder::Builder;

use crate::{Map, Set};
use crate::job::{FileManifest, Job, Resource, Status};
use crate::remote::{CommandOutput, CommandRunner, RemoteExecutor, RetryPolicy, RunnerFuture};
use crate::scheduler::{
    BackendError, BackendFuture, BackendResult, RawState, SchedulerBackend, SchedulerFamily,
    SubmitOutcome,
};

pub fn resource(name: &str) -> Resource {
    Resource {
        name: name.to_string(),
        host: format!("{name}.example.org"),
        port: 22,
        user: "user".to_string(),
        identity: None,
        scheduler: None,
        handler: None,
        cores_per_node: 24,
        remote_workdir: "/scratch/user".to_string(),
        account_flag: None,
        parallel_environment: None,
    }
}

pub fn job(name: &str) -> Job {
    Job {
        name: name.to_string(),
        resource: "cluster".to_string(),
        local_workdir: PathBuf::from("/tmp/hpcb-tests").join(name),
        remote_dir_name: String::new(),
        executable: "app".to_string(),
        arguments: vec![],
        handler: None,
        cores: 1,
        cores_per_node: None,
        replicates: 1,
        walltime: Duration::from_secs(24 * 3600),
        queue: None,
        account: None,
        memory_gb: None,
        email_address: None,
        email_flags: None,
        modules: vec![],
        scripts: vec![],
        poll_interval: Duration::from_secs(300),
        staging_interval: Duration::from_secs(300),
        status: Status::Prepared,
        remote_id: None,
        script_path: None,
        staged: false,
        last_error: None,
        error_count: 0,
        upload: FileManifest::default(),
        download: FileManifest::default(),
    }
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct TestJob {
    #[builder(setter(into))]
    name: String,
    #[builder(default = "\"cluster\".to_string()", setter(into))]
    resource: String,
    #[builder(default)]
    local_workdir: PathBuf,
    #[builder(default = "Duration::ZERO")]
    poll_interval: Duration,
    #[builder(default = "Duration::ZERO")]
    staging_interval: Duration,
    #[builder(default = "Status::Prepared")]
    status: Status,
    #[builder(default)]
    remote_id: Option<String>,
    #[builder(default)]
    remote_dir_name: String,
    #[builder(default)]
    staged: bool,
}

impl TestJobBuilder {
    pub fn build(self) -> Job {
        let TestJob {
            name,
            resource,
            local_workdir,
            poll_interval,
            staging_interval,
            status,
            remote_id,
            remote_dir_name,
            staged,
        } = self.finish().unwrap();
        let mut job = job(&name);
        job.resource = resource;
        job.local_workdir = local_workdir;
        job.poll_interval = poll_interval;
        job.staging_interval = staging_interval;
        job.status = status;
        job.remote_id = remote_id;
        job.remote_dir_name = remote_dir_name;
        job.staged = staged;
        job
    }
}

fn test_executor(runner: Box<dyn CommandRunner>) -> RemoteExecutor {
    RemoteExecutor::new(
        runner,
        RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        },
        "ssh".to_string(),
        "rsync".to_string(),
    )
}

#[derive(Default)]
struct ScriptedState {
    responses: VecDeque<CommandOutput>,
    calls: Vec<(String, Vec<String>)>,
}

/// Returns prepared outputs in order, then succeeds with an empty output.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Rc<RefCell<ScriptedState>>,
}

impl ScriptedRunner {
    /// Responses given as (exit code, stdout).
    pub fn new(responses: Vec<(i32, String)>) -> Self {
        Self::with_outputs(
            responses
                .into_iter()
                .map(|(exit_code, stdout)| (exit_code, stdout, String::new()))
                .collect(),
        )
    }

    /// Responses given as (exit code, stdout, stderr).
    pub fn with_outputs(responses: Vec<(i32, String, String)>) -> Self {
        let responses = responses
            .into_iter()
            .map(|(exit_code, stdout, stderr)| CommandOutput {
                stdout,
                stderr,
                exit_code,
            })
            .collect();
        Self {
            state: Rc::new(RefCell::new(ScriptedState {
                responses,
                calls: vec![],
            })),
        }
    }

    pub fn executor(&self) -> RemoteExecutor {
        test_executor(Box::new(self.clone()))
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.state.borrow().calls.clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> RunnerFuture<'a> {
        let mut state = self.state.borrow_mut();
        state.calls.push((program.to_string(), args.to_vec()));
        let output = state.responses.pop_front().unwrap_or_default();
        Box::pin(async move { Ok(output) })
    }
}

#[derive(Default)]
struct RemoteFsState {
    paths: BTreeSet<String>,
    commands: Vec<String>,
}

/// Emulates the remote file system affected by `rm`, `mkdir` and uploads.
#[derive(Clone, Default)]
pub struct RemoteFsRunner {
    state: Rc<RefCell<RemoteFsState>>,
}

impl RemoteFsRunner {
    pub fn executor(&self) -> RemoteExecutor {
        test_executor(Box::new(self.clone()))
    }

    pub fn insert(&self, path: &str) {
        self.state.borrow_mut().paths.insert(path.to_string());
    }

    pub fn paths(&self) -> Vec<String> {
        self.state.borrow().paths.iter().cloned().collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    /// Appends an event which did not go through the runner to the command log.
    pub fn record(&self, event: String) {
        self.state.borrow_mut().commands.push(event);
    }

    fn run_shell(state: &mut RemoteFsState, command: &str) {
        for part in command.split(" && ") {
            let words: Vec<&str> = part.split_whitespace().collect();
            match words.as_slice() {
                ["rm", "-rf", path] => {
                    let prefix = format!("{path}/");
                    state
                        .paths
                        .retain(|existing| existing != path && !existing.starts_with(&prefix));
                }
                ["mkdir", "-p", directories @ ..] => {
                    for directory in directories {
                        state.paths.insert(directory.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    fn run_rsync(state: &mut RemoteFsState, args: &[String]) {
        let [.., source, destination] = args else {
            return;
        };
        let Some((_, remote)) = destination.split_once(':') else {
            return;
        };
        let remote = remote.trim_end_matches('/');
        if let Ok(entries) = std::fs::read_dir(source.trim_end_matches('/')) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                state.paths.insert(format!("{remote}/{name}"));
            }
        }
    }
}

impl CommandRunner for RemoteFsRunner {
    fn run<'a>(&'a self, program: &'a str, args: &'a [String]) -> RunnerFuture<'a> {
        let mut state = self.state.borrow_mut();
        match program {
            "ssh" => {
                let command = args.last().cloned().unwrap_or_default();
                Self::run_shell(&mut state, &command);
                state.commands.push(command);
            }
            "rsync" => {
                Self::run_rsync(&mut state, args);
                state.commands.push(format!("rsync {}", args.join(" ")));
            }
            _ => {}
        }
        Box::pin(async move { Ok(CommandOutput::default()) })
    }
}

type SubmitFn<State> = Box<dyn Fn(&mut State, &Job) -> BackendResult<SubmitOutcome>>;
type StatusFn<State> = Box<dyn Fn(&mut State, &Job) -> BackendResult<RawState>>;
type DeleteFn<State> = Box<dyn Fn(&mut State, &Job) -> BackendResult<()>>;

/// Scheduler backend driven by closures operating on a shared state.
pub struct Handler<State> {
    state: Rc<RefCell<State>>,
    submit_fn: SubmitFn<State>,
    status_fn: StatusFn<State>,
    delete_fn: Option<DeleteFn<State>>,
}

impl<State: 'static> Handler<State> {
    pub fn new(
        state: Rc<RefCell<State>>,
        submit_fn: impl Fn(&mut State, &Job) -> BackendResult<SubmitOutcome> + 'static,
        status_fn: impl Fn(&mut State, &Job) -> BackendResult<RawState> + 'static,
    ) -> Self {
        Self {
            state,
            submit_fn: Box::new(submit_fn),
            status_fn: Box::new(status_fn),
            delete_fn: None,
        }
    }

    pub fn with_delete(
        mut self,
        delete_fn: impl Fn(&mut State, &Job) -> BackendResult<()> + 'static,
    ) -> Self {
        self.delete_fn = Some(Box::new(delete_fn));
        self
    }

    pub fn into_backend(self) -> Rc<dyn SchedulerBackend> {
        Rc::new(self)
    }
}

impl<State> SchedulerBackend for Handler<State> {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::Pbs
    }

    fn build_submission_script(&self, job: &Job, _resource: &Resource) -> BackendResult<String> {
        Ok(format!("#!/bin/bash\n{}\n", job.executable))
    }

    fn submit<'a>(
        &'a self,
        job: &'a Job,
        _resource: &'a Resource,
    ) -> BackendFuture<'a, SubmitOutcome> {
        let result = (self.submit_fn)(&mut self.state.borrow_mut(), job);
        Box::pin(async move { result })
    }

    fn status<'a>(&'a self, job: &'a Job, _resource: &'a Resource) -> BackendFuture<'a, RawState> {
        let result = (self.status_fn)(&mut self.state.borrow_mut(), job);
        Box::pin(async move { result })
    }

    fn delete<'a>(&'a self, job: &'a Job, _resource: &'a Resource) -> BackendFuture<'a, ()> {
        let result = match &self.delete_fn {
            Some(delete_fn) => delete_fn(&mut self.state.borrow_mut(), job),
            None => Err(BackendError::CapabilityMissing {
                family: self.family(),
                capability: "delete",
            }),
        };
        Box::pin(async move { result })
    }
}

/// State of a fake scheduler queue.
#[derive(Default)]
pub struct FakeQueue {
    /// Jobs are refused while this many jobs are in the queue.
    pub limit: Option<usize>,
    /// States reported for a job (by name), one per status query.
    pub scripts: Map<String, VecDeque<RawState>>,
    /// State reported once the script of a job is exhausted, `Finished` if not set.
    pub default_state: Option<RawState>,
    /// Number of status queries of a job which fail before it is reported normally.
    pub failing_status: Map<String, usize>,
    /// Jobs refused by the scheduler with an error.
    pub refused: Set<String>,
    /// Remote id -> job name of jobs in the queue.
    pub active: Map<String, String>,
    pub submissions: Vec<String>,
    pub rejections: Vec<String>,
    pub deleted: Vec<String>,
    pub next_id: u32,
    /// Deletions are logged as `delete <name>` into this runner's command log.
    pub events: Option<RemoteFsRunner>,
}

impl FakeQueue {
    pub fn script(&mut self, job: &str, states: &[RawState]) {
        self.scripts
            .insert(job.to_string(), states.iter().copied().collect());
    }
}

pub fn queue_backend(queue: Rc<RefCell<FakeQueue>>) -> Rc<dyn SchedulerBackend> {
    Handler::new(
        queue,
        |queue, job| {
            queue.submissions.push(job.name.clone());
            if queue.refused.contains(&job.name) {
                return Err(BackendError::Submission {
                    job: job.name.clone(),
                    diagnosis: "Unknown queue".to_string(),
                    output: "qsub: Unknown queue".to_string(),
                });
            }
            if let Some(limit) = queue.limit {
                if queue.active.len() >= limit {
                    queue.rejections.push(job.name.clone());
                    return Ok(SubmitOutcome::AdmissionExhausted);
                }
            }
            queue.next_id += 1;
            let id = format!("{}.fake", queue.next_id);
            queue.active.insert(id.clone(), job.name.clone());
            Ok(SubmitOutcome::Submitted(id))
        },
        |queue, job| {
            if let Some(remaining) = queue.failing_status.get_mut(&job.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::MalformedResponse {
                        family: SchedulerFamily::Pbs,
                        message: "garbled listing".to_string(),
                    });
                }
            }
            let state = queue
                .scripts
                .get_mut(&job.name)
                .and_then(|states| states.pop_front())
                .or(queue.default_state)
                .unwrap_or(RawState::Finished);
            if state == RawState::Finished {
                if let Some(id) = &job.remote_id {
                    queue.active.remove(id);
                }
            }
            Ok(state)
        },
    )
    .with_delete(|queue, job| {
        queue.deleted.push(job.name.clone());
        if let Some(events) = &queue.events {
            events.record(format!("delete {}", job.name));
        }
        if let Some(id) = &job.remote_id {
            queue.active.remove(id);
        }
        Ok(())
    })
    .into_backend()
}
