use std::fmt::Write;
use std::rc::Rc;

use crate::common::timeutils::format_hms_duration;
use crate::job::{Job, Resource};
use crate::remote::RemoteExecutor;
use crate::scheduler::common::{run_delete, run_status, run_submit, script_body, StateColumn, SHEBANG};
use crate::scheduler::{
    BackendFuture, BackendResult, RawState, SchedulerBackend, SchedulerFamily, SubmitOutcome,
};

const LIMIT_PHRASES: &[&str] = &["jobs are allowed per user", "maximum number of jobs"];
const GONE_PHRASES: &[&str] = &["does not exist"];
const DEFAULT_PARALLEL_ENVIRONMENT: &str = "mpi";

pub struct SgeBackend {
    executor: Rc<RemoteExecutor>,
}

impl SgeBackend {
    pub fn new(executor: Rc<RemoteExecutor>) -> Self {
        Self { executor }
    }
}

impl SchedulerBackend for SgeBackend {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::Sge
    }

    fn build_submission_script(&self, job: &Job, resource: &Resource) -> BackendResult<String> {
        Ok(build_sge_submit_script(job, resource))
    }

    fn submit<'a>(
        &'a self,
        job: &'a Job,
        resource: &'a Resource,
    ) -> BackendFuture<'a, SubmitOutcome> {
        Box::pin(async move {
            let command = format!("qsub {}", SchedulerFamily::Sge.script_name());
            run_submit(
                &self.executor,
                job,
                resource,
                SchedulerFamily::Sge,
                command,
                LIMIT_PHRASES,
                parse_sge_job_id,
            )
            .await
        })
    }

    fn status<'a>(&'a self, job: &'a Job, resource: &'a Resource) -> BackendFuture<'a, RawState> {
        Box::pin(async move {
            run_status(
                &self.executor,
                job,
                resource,
                SchedulerFamily::Sge,
                format!("qstat -u {}", resource.user),
                StateColumn::Index(4),
                &[],
                parse_sge_state,
            )
            .await
        })
    }

    fn delete<'a>(&'a self, job: &'a Job, resource: &'a Resource) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            run_delete(&self.executor, job, resource, "qdel", GONE_PHRASES).await
        })
    }
}

/// `Your job 1234 ("md") has been submitted` or
/// `Your job-array 1234.1-4:1 ("md") has been submitted`
fn parse_sge_job_id(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == "job" || word == "job-array" {
            let id = words.next()?.split('.').next()?;
            if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// SGE state codes combine several letters, e.g. `hqw` or `Eqw`.
fn parse_sge_state(code: &str) -> Option<RawState> {
    let state = if code.contains('d') {
        RawState::Finished
    } else if code.contains('h') || code.contains('E') || code.contains('s') || code.contains('S') {
        RawState::Held
    } else if matches!(code, "r" | "t" | "Rr" | "Rt") {
        RawState::Running
    } else if code == "qw" {
        RawState::Queued
    } else {
        return None;
    };
    Some(state)
}

fn build_sge_submit_script(job: &Job, resource: &Resource) -> String {
    let mut script = format!(
        r##"{SHEBANG}
#$ -cwd
#$ -V
#$ -N {name}
"##,
        name = job.name
    );
    if let Some(queue) = &job.queue {
        writeln!(script, "#$ -q {queue}").unwrap();
    }
    if let Some(account) = &job.account {
        writeln!(script, "#$ -A {account}").unwrap();
    }
    writeln!(script, "#$ -l h_rt={}", format_hms_duration(&job.walltime)).unwrap();
    if job.cores > 1 {
        let environment = resource
            .parallel_environment
            .as_deref()
            .unwrap_or(DEFAULT_PARALLEL_ENVIRONMENT);
        writeln!(script, "#$ -pe {environment} {}", job.cores).unwrap();
    }
    if let Some(memory) = job.memory_gb {
        writeln!(script, "#$ -l h_vmem={memory}G").unwrap();
    }
    if let Some(address) = &job.email_address {
        writeln!(script, "#$ -M {address}").unwrap();
    }
    if let Some(flags) = &job.email_flags {
        writeln!(script, "#$ -m {flags}").unwrap();
    }
    if job.is_array() {
        writeln!(script, "#$ -t 1-{}", job.replicates).unwrap();
    }
    script.push('\n');
    script.push_str(&script_body(job, resource, "SGE_O_WORKDIR", "SGE_TASK_ID"));
    script
}
