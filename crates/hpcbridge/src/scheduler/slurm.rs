use std::fmt::Write;
use std::rc::Rc;

use crate::common::timeutils::format_hms_duration;
use crate::job::{Job, Resource};
use crate::remote::RemoteExecutor;
use crate::scheduler::common::{
    node_layout, run_delete, run_status, run_submit, script_body, StateColumn, SHEBANG,
};
use crate::scheduler::{
    BackendFuture, BackendResult, RawState, SchedulerBackend, SchedulerFamily, SubmitOutcome,
};

const LIMIT_PHRASES: &[&str] = &["MaxSubmitJob", "QOSMaxSubmitJobPerUserLimit"];
const GONE_PHRASES: &[&str] = &["invalid job id", "already completing or completed"];

pub struct SlurmBackend {
    executor: Rc<RemoteExecutor>,
}

impl SlurmBackend {
    pub fn new(executor: Rc<RemoteExecutor>) -> Self {
        Self { executor }
    }
}

impl SchedulerBackend for SlurmBackend {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::Slurm
    }

    fn build_submission_script(&self, job: &Job, resource: &Resource) -> BackendResult<String> {
        Ok(build_slurm_submit_script(job, resource))
    }

    fn submit<'a>(
        &'a self,
        job: &'a Job,
        resource: &'a Resource,
    ) -> BackendFuture<'a, SubmitOutcome> {
        Box::pin(async move {
            let command = format!("sbatch {}", SchedulerFamily::Slurm.script_name());
            run_submit(
                &self.executor,
                job,
                resource,
                SchedulerFamily::Slurm,
                command,
                LIMIT_PHRASES,
                parse_slurm_job_id,
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
                SchedulerFamily::Slurm,
                format!("squeue -u {}", resource.user),
                StateColumn::Index(4),
                &[],
                parse_slurm_state,
            )
            .await
        })
    }

    fn delete<'a>(&'a self, job: &'a Job, resource: &'a Resource) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            run_delete(&self.executor, job, resource, "scancel", GONE_PHRASES).await
        })
    }
}

/// `Submitted batch job 1234`
fn parse_slurm_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
        .map(|id| id.trim())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .map(|id| id.to_string())
}

fn parse_slurm_state(code: &str) -> Option<RawState> {
    let state = match code {
        "PD" | "CF" => RawState::Queued,
        "R" | "CG" => RawState::Running,
        "S" | "ST" => RawState::Held,
        "CD" | "F" | "CA" | "TO" | "NF" | "PR" => RawState::Finished,
        _ => return None,
    };
    Some(state)
}

fn build_slurm_submit_script(job: &Job, resource: &Resource) -> String {
    let layout = node_layout(job, resource);
    let mut script = format!(
        r##"{SHEBANG}
#SBATCH -J {name}
"##,
        name = job.name
    );
    if let Some(queue) = &job.queue {
        writeln!(script, "#SBATCH -p {queue}").unwrap();
    }
    if let Some(account) = &job.account {
        let flag = resource.account_flag.as_deref().unwrap_or("--account");
        writeln!(script, "#SBATCH {flag}={account}").unwrap();
    }
    writeln!(script, "#SBATCH -t {}", format_hms_duration(&job.walltime)).unwrap();
    writeln!(script, "#SBATCH -N {}", layout.nodes).unwrap();
    writeln!(script, "#SBATCH -n {}", job.cores.max(1)).unwrap();
    writeln!(
        script,
        "#SBATCH --ntasks-per-node={}",
        layout.cores_per_node
    )
    .unwrap();
    if let Some(memory) = job.memory_gb {
        writeln!(script, "#SBATCH --mem={memory}G").unwrap();
    }
    if let Some(address) = &job.email_address {
        writeln!(script, "#SBATCH --mail-user={address}").unwrap();
    }
    if let Some(flags) = &job.email_flags {
        writeln!(script, "#SBATCH --mail-type={flags}").unwrap();
    }
    if job.is_array() {
        writeln!(script, "#SBATCH --array=1-{}", job.replicates).unwrap();
    }
    script.push('\n');
    script.push_str(&script_body(
        job,
        resource,
        "SLURM_SUBMIT_DIR",
        "SLURM_ARRAY_TASK_ID",
    ));
    script
}
