use std::fmt::Write;

use crate::engine::config::SSH_TRANSPORT_FAULT;
use crate::job::{Job, Resource};
use crate::remote::{CommandOutput, RemoteError, RemoteExecutor};
use crate::scheduler::{BackendError, BackendResult, RawState, SchedulerFamily, SubmitOutcome};

pub const SHEBANG: &str = "#!/bin/bash --login";

/// Whole nodes needed to host the cores of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    pub nodes: u32,
    pub cores_per_node: u32,
}

pub fn node_layout(job: &Job, resource: &Resource) -> NodeLayout {
    let cores = job.cores.max(1);
    let cores_per_node = job.cores_per_node(resource).clamp(1, cores);
    NodeLayout {
        nodes: cores.div_ceil(cores_per_node),
        cores_per_node,
    }
}

/// Command line starting the executable of the job, prefixed with its launcher.
pub fn launch_line(job: &Job, resource: &Resource) -> String {
    let mut parts = vec![];
    match job.handler(resource) {
        Some("aprun") => {
            let layout = node_layout(job, resource);
            parts.push(format!(
                "aprun -n {} -N {}",
                job.cores, layout.cores_per_node
            ));
        }
        Some(handler) => parts.push(handler.to_string()),
        None => {}
    }
    parts.push(job.executable.clone());
    parts.extend(job.arguments.iter().cloned());
    parts.join(" ")
}

/// Part of the script following the directives: environment setup and the launch line.
///
/// `workdir_var` holds the directory from which the job was submitted, `array_var` the
/// index of an array task.
pub fn script_body(job: &Job, resource: &Resource, workdir_var: &str, array_var: &str) -> String {
    let mut body = String::new();
    for module in &job.modules {
        writeln!(body, "module load {module}").unwrap();
    }
    if !job.modules.is_empty() {
        body.push('\n');
    }
    for snippet in &job.scripts {
        writeln!(body, "{}", snippet.trim_end()).unwrap();
    }
    if !job.scripts.is_empty() {
        body.push('\n');
    }
    if job.is_array() {
        writeln!(body, "cd ${workdir_var}/rep${{{array_var}}}").unwrap();
    } else {
        writeln!(body, "cd ${workdir_var}").unwrap();
    }
    writeln!(body, "{}", launch_line(job, resource)).unwrap();
    body
}

pub fn remote_id(job: &Job) -> BackendResult<&str> {
    job.remote_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BackendError::MissingRemoteId(job.name.clone()))
}

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    let text = text.to_lowercase();
    phrases
        .iter()
        .any(|phrase| text.contains(&phrase.to_lowercase()))
}

/// Well known rejection reasons and their explanation.
const DIAGNOSES: &[(&[&str], &str)] = &[
    (
        &[
            "invalid account",
            "account required",
            "no account",
            "invalid project",
            "not a valid project",
            "invalid charge",
        ],
        "The account (charge code) is missing or invalid, check the `account` of the job",
    ),
    (
        &["name too long", "name is too long", "job name too long"],
        "The job name is too long for the scheduler, use a shorter job name",
    ),
    (
        &[
            "exceeds queue resource limits",
            "exceed the limit",
            "exceeds the maximum",
            "requested node configuration is not available",
            "exceeds limit",
            "more processors than",
        ],
        "The requested resources exceed the limits of the queue, lower the cores, memory or wall time",
    ),
];

pub fn diagnose_submission_failure(output: &str) -> String {
    DIAGNOSES
        .iter()
        .find(|(phrases, _)| contains_any(output, phrases))
        .map(|(_, diagnosis)| diagnosis.to_string())
        .unwrap_or_else(|| "The scheduler rejected the job".to_string())
}

fn output_text(output: &CommandOutput) -> String {
    format!("{}\n{}", output.stdout.trim(), output.stderr.trim())
        .trim()
        .to_string()
}

/// Executes `command` from the remote directory of the job and decodes the response.
pub async fn run_submit<F>(
    executor: &RemoteExecutor,
    job: &Job,
    resource: &Resource,
    family: SchedulerFamily,
    command: String,
    limit_phrases: &[&str],
    parse_id: F,
) -> BackendResult<SubmitOutcome>
where
    F: FnOnce(&str) -> Option<String>,
{
    let commands = [format!("cd {}", job.remote_workdir(resource)), command];
    match executor.execute(resource, &commands).await {
        Ok(output) => {
            if contains_any(&output.combined(), limit_phrases) {
                return Ok(SubmitOutcome::AdmissionExhausted);
            }
            match parse_id(&output.stdout) {
                Some(id) => Ok(SubmitOutcome::Submitted(id)),
                None => Err(BackendError::MalformedResponse {
                    family,
                    message: format!("cannot find job id in `{}`", output.stdout.trim()),
                }),
            }
        }
        Err(RemoteError::Execution {
            stdout,
            stderr,
            exit_code,
            ..
        }) if exit_code != SSH_TRANSPORT_FAULT => {
            let output = CommandOutput {
                stdout,
                stderr,
                exit_code,
            };
            let text = output_text(&output);
            if contains_any(&text, limit_phrases) {
                log::debug!("{family} refused job `{}` with a job limit: {text}", job.name);
                Ok(SubmitOutcome::AdmissionExhausted)
            } else {
                Err(BackendError::Submission {
                    job: job.name.clone(),
                    diagnosis: diagnose_submission_failure(&text),
                    output: text,
                })
            }
        }
        Err(error) => Err(error.into()),
    }
}

/// Position of the state column in a listing row.
#[derive(Debug, Copy, Clone)]
pub enum StateColumn {
    /// Zero-based index from the start of the row.
    Index(usize),
    /// One-based index from the end of the row.
    FromEnd(usize),
}

impl StateColumn {
    fn get<'a>(&self, fields: &[&'a str]) -> Option<&'a str> {
        match *self {
            StateColumn::Index(index) => fields.get(index).copied(),
            StateColumn::FromEnd(index) => fields
                .len()
                .checked_sub(index)
                .and_then(|i| fields.get(i).copied()),
        }
    }
}

/// Does `field` refer to the job `id`, possibly to one of its array tasks?
fn matches_job_id(field: &str, id: &str) -> bool {
    let key = id.split('.').next().unwrap_or(id);
    if key.is_empty() {
        return false;
    }
    if field == id || field == key {
        return true;
    }
    field
        .strip_prefix(key)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| matches!(c, '.' | '[' | '_'))
}

/// Finds the state of a job in a scheduler listing.
///
/// Rows of array tasks are merged, the job is running while any of its tasks runs.
/// A job without any row has left the queue.
pub fn parse_listing<F>(
    listing: &str,
    id: &str,
    column: StateColumn,
    family: SchedulerFamily,
    map_state: F,
) -> BackendResult<RawState>
where
    F: Fn(&str) -> Option<RawState>,
{
    let mut states = vec![];
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if !fields.iter().any(|field| matches_job_id(field, id)) {
            continue;
        }
        let code = column
            .get(&fields)
            .ok_or_else(|| BackendError::MalformedResponse {
                family,
                message: format!("missing state column in `{line}`"),
            })?;
        let state = map_state(code).ok_or_else(|| BackendError::MalformedResponse {
            family,
            message: format!("unknown job state `{code}`"),
        })?;
        states.push(state);
    }
    Ok(merge_states(&states))
}

fn merge_states(states: &[RawState]) -> RawState {
    [RawState::Running, RawState::Queued, RawState::Held]
        .into_iter()
        .find(|state| states.contains(state))
        .unwrap_or(RawState::Finished)
}

#[allow(clippy::too_many_arguments)]
pub async fn run_status<F>(
    executor: &RemoteExecutor,
    job: &Job,
    resource: &Resource,
    family: SchedulerFamily,
    command: String,
    column: StateColumn,
    empty_phrases: &[&str],
    map_state: F,
) -> BackendResult<RawState>
where
    F: Fn(&str) -> Option<RawState>,
{
    let id = remote_id(job)?;
    let listing = match executor.execute(resource, &[command]).await {
        Ok(output) => output.stdout,
        Err(RemoteError::Execution {
            stdout,
            stderr,
            exit_code,
            ..
        }) if exit_code != SSH_TRANSPORT_FAULT
            && contains_any(&format!("{stdout}\n{stderr}"), empty_phrases) =>
        {
            String::new()
        }
        Err(error) => return Err(error.into()),
    };
    parse_listing(&listing, id, column, family, map_state)
}

pub async fn run_delete(
    executor: &RemoteExecutor,
    job: &Job,
    resource: &Resource,
    command: &str,
    gone_phrases: &[&str],
) -> BackendResult<()> {
    let Some(id) = job.remote_id.as_deref() else {
        return Ok(());
    };
    match executor.execute(resource, &[format!("{command} {id}")]).await {
        Ok(_) => Ok(()),
        Err(RemoteError::Execution {
            stdout,
            stderr,
            exit_code,
            ..
        }) if exit_code != SSH_TRANSPORT_FAULT
            && contains_any(&format!("{stdout}\n{stderr}"), gone_phrases) =>
        {
            log::debug!("Job `{}` ({id}) was already gone", job.name);
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}
