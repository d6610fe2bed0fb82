use std::fmt::Write;
use std::rc::Rc;

use crate::common::timeutils::format_hm_duration;
use crate::job::{Job, Resource};
use crate::remote::RemoteExecutor;
use crate::scheduler::common::{
    node_layout, run_delete, run_status, run_submit, script_body, StateColumn, SHEBANG,
};
use crate::scheduler::{
    BackendFuture, BackendResult, RawState, SchedulerBackend, SchedulerFamily, SubmitOutcome,
};

const LIMIT_PHRASES: &[&str] = &["job threshold", "pending job limit"];
const GONE_PHRASES: &[&str] = &["has already finished", "no matching job found"];
const EMPTY_LISTING_PHRASES: &[&str] = &["no unfinished job found", "no job found"];

pub struct LsfBackend {
    executor: Rc<RemoteExecutor>,
}

impl LsfBackend {
    pub fn new(executor: Rc<RemoteExecutor>) -> Self {
        Self { executor }
    }
}

impl SchedulerBackend for LsfBackend {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::Lsf
    }

    fn build_submission_script(&self, job: &Job, resource: &Resource) -> BackendResult<String> {
        Ok(build_lsf_submit_script(job, resource))
    }

    fn submit<'a>(
        &'a self,
        job: &'a Job,
        resource: &'a Resource,
    ) -> BackendFuture<'a, SubmitOutcome> {
        Box::pin(async move {
            let command = format!("bsub < {}", SchedulerFamily::Lsf.script_name());
            run_submit(
                &self.executor,
                job,
                resource,
                SchedulerFamily::Lsf,
                command,
                LIMIT_PHRASES,
                parse_lsf_job_id,
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
                SchedulerFamily::Lsf,
                format!("bjobs -u {}", resource.user),
                StateColumn::Index(2),
                EMPTY_LISTING_PHRASES,
                parse_lsf_state,
            )
            .await
        })
    }

    fn delete<'a>(&'a self, job: &'a Job, resource: &'a Resource) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            run_delete(&self.executor, job, resource, "bkill", GONE_PHRASES).await
        })
    }
}

/// `Job <1234> is submitted to queue <normal>.`
fn parse_lsf_job_id(output: &str) -> Option<String> {
    let start = output.find('<')?;
    let rest = &output[start + 1..];
    let end = rest.find('>')?;
    let id = &rest[..end];
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

fn parse_lsf_state(code: &str) -> Option<RawState> {
    let state = match code {
        "PEND" => RawState::Queued,
        "RUN" => RawState::Running,
        "PSUSP" | "USUSP" | "SSUSP" => RawState::Held,
        "DONE" | "EXIT" | "ZOMBI" | "UNKWN" => RawState::Finished,
        _ => return None,
    };
    Some(state)
}

fn build_lsf_submit_script(job: &Job, resource: &Resource) -> String {
    let layout = node_layout(job, resource);
    let mut script = format!("{SHEBANG}\n");
    if job.is_array() {
        writeln!(script, "#BSUB -J {}[1-{}]", job.name, job.replicates).unwrap();
    } else {
        writeln!(script, "#BSUB -J {}", job.name).unwrap();
    }
    if let Some(queue) = &job.queue {
        writeln!(script, "#BSUB -q {queue}").unwrap();
    }
    if let Some(account) = &job.account {
        writeln!(script, "#BSUB -P {account}").unwrap();
    }
    writeln!(script, "#BSUB -W {}", format_hm_duration(&job.walltime)).unwrap();
    writeln!(script, "#BSUB -n {}", job.cores.max(1)).unwrap();
    writeln!(script, "#BSUB -R \"span[ptile={}]\"", layout.cores_per_node).unwrap();
    if let Some(memory) = job.memory_gb {
        writeln!(script, "#BSUB -R \"rusage[mem={memory}GB]\"").unwrap();
    }
    if let Some(address) = &job.email_address {
        writeln!(script, "#BSUB -u {address}").unwrap();
    }
    if let Some(flags) = &job.email_flags {
        if flags.contains('b') {
            script.push_str("#BSUB -B\n");
        }
        if flags.contains('e') {
            script.push_str("#BSUB -N\n");
        }
    }
    if job.is_array() {
        script.push_str("#BSUB -o %J.%I.out\n#BSUB -e %J.%I.err\n");
    } else {
        script.push_str("#BSUB -o %J.out\n#BSUB -e %J.err\n");
    }
    script.push('\n');
    script.push_str(&script_body(job, resource, "LS_SUBCWD", "LSB_JOBINDEX"));
    script
}
