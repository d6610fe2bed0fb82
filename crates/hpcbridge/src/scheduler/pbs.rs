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

const LIMIT_PHRASES: &[&str] = &["would exceed"];
const GONE_PHRASES: &[&str] = &["unknown job id", "job has finished", "request invalid for state"];

pub struct PbsBackend {
    executor: Rc<RemoteExecutor>,
}

impl PbsBackend {
    pub fn new(executor: Rc<RemoteExecutor>) -> Self {
        Self { executor }
    }
}

impl SchedulerBackend for PbsBackend {
    fn family(&self) -> SchedulerFamily {
        SchedulerFamily::Pbs
    }

    fn build_submission_script(&self, job: &Job, resource: &Resource) -> BackendResult<String> {
        Ok(build_pbs_submit_script(job, resource))
    }

    fn submit<'a>(
        &'a self,
        job: &'a Job,
        resource: &'a Resource,
    ) -> BackendFuture<'a, SubmitOutcome> {
        Box::pin(async move {
            let command = format!("qsub {}", SchedulerFamily::Pbs.script_name());
            run_submit(
                &self.executor,
                job,
                resource,
                SchedulerFamily::Pbs,
                command,
                LIMIT_PHRASES,
                parse_pbs_job_id,
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
                SchedulerFamily::Pbs,
                format!("qstat -u {}", resource.user),
                StateColumn::FromEnd(2),
                &[],
                parse_pbs_state,
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

/// `qsub` prints just the job id, e.g. `1234.pbs-server`.
fn parse_pbs_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .filter(|line| !line.contains(char::is_whitespace))
        .map(|line| line.to_string())
}

fn parse_pbs_state(code: &str) -> Option<RawState> {
    let state = match code {
        "Q" | "W" | "T" => RawState::Queued,
        "R" | "E" | "B" => RawState::Running,
        "H" | "S" | "U" => RawState::Held,
        "F" | "X" => RawState::Finished,
        _ => return None,
    };
    Some(state)
}

fn build_pbs_submit_script(job: &Job, resource: &Resource) -> String {
    let layout = node_layout(job, resource);
    let mut script = format!(
        r##"{SHEBANG}
#PBS -N {name}
"##,
        name = job.name
    );
    if let Some(queue) = &job.queue {
        writeln!(script, "#PBS -q {queue}").unwrap();
    }
    if let Some(account) = &job.account {
        let flag = resource.account_flag.as_deref().unwrap_or("-A");
        writeln!(script, "#PBS {flag} {account}").unwrap();
    }
    writeln!(
        script,
        "#PBS -l walltime={}",
        format_hms_duration(&job.walltime)
    )
    .unwrap();
    write!(
        script,
        "#PBS -l select={}:ncpus={cpn}:mpiprocs={cpn}",
        layout.nodes,
        cpn = layout.cores_per_node
    )
    .unwrap();
    if let Some(memory) = job.memory_gb {
        write!(script, ":mem={memory}gb").unwrap();
    }
    script.push('\n');
    if let Some(flags) = &job.email_flags {
        writeln!(script, "#PBS -m {flags}").unwrap();
    }
    if let Some(address) = &job.email_address {
        writeln!(script, "#PBS -M {address}").unwrap();
    }
    if job.is_array() {
        writeln!(script, "#PBS -J 1-{}", job.replicates).unwrap();
    }
    script.push('\n');
    script.push_str(&script_body(job, resource, "PBS_O_WORKDIR", "PBS_ARRAY_INDEX"));
    script
}

#[cfg(test)]
mod tests {
    use super::{build_pbs_submit_script, parse_pbs_job_id, PbsBackend};
    use crate::scheduler::{RawState, SchedulerBackend, SubmitOutcome};
    use crate::tests::utils::{job, resource, ScriptedRunner};
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn script_single_job() {
        let mut resource = resource("archer");
        resource.cores_per_node = 24;
        resource.handler = Some("aprun".to_string());
        let mut job = job("md");
        job.cores = 48;
        job.queue = Some("standard".to_string());
        job.account = Some("e280".to_string());
        job.walltime = Duration::from_secs(2 * 3600 + 30 * 60);
        job.executable = "pmemd.MPI".to_string();
        job.arguments = vec!["-O".to_string(), "-i".to_string(), "md.in".to_string()];
        job.modules = vec!["amber".to_string()];
        job.email_address = Some("user@example.org".to_string());
        job.email_flags = Some("ae".to_string());

        insta::assert_snapshot!(build_pbs_submit_script(&job, &resource), @r###"
        #!/bin/bash --login
        #PBS -N md
        #PBS -q standard
        #PBS -A e280
        #PBS -l walltime=02:30:00
        #PBS -l select=2:ncpus=24:mpiprocs=24
        #PBS -m ae
        #PBS -M user@example.org

        module load amber

        cd $PBS_O_WORKDIR
        aprun -n 48 -N 24 pmemd.MPI -O -i md.in
        "###);
    }

    #[test]
    fn script_array_job() {
        let mut resource = resource("cluster");
        resource.account_flag = Some("-P".to_string());
        let mut job = job("ensemble");
        job.replicates = 5;
        job.account = Some("proj1".to_string());
        job.memory_gb = Some(16);
        job.scripts = vec!["export OMP_NUM_THREADS=1".to_string()];

        insta::assert_snapshot!(build_pbs_submit_script(&job, &resource), @r###"
        #!/bin/bash --login
        #PBS -N ensemble
        #PBS -P proj1
        #PBS -l walltime=24:00:00
        #PBS -l select=1:ncpus=1:mpiprocs=1:mem=16gb
        #PBS -J 1-5

        export OMP_NUM_THREADS=1

        cd $PBS_O_WORKDIR/rep${PBS_ARRAY_INDEX}
        app
        "###);
    }

    #[test]
    fn job_id() {
        assert_eq!(
            parse_pbs_job_id("\n1234.sdb\n").as_deref(),
            Some("1234.sdb")
        );
        assert_eq!(parse_pbs_job_id(""), None);
        assert_eq!(parse_pbs_job_id("qsub: something else"), None);
    }

    #[tokio::test]
    async fn submit_from_job_directory() {
        let runner = ScriptedRunner::new(vec![(0, "1234.sdb\n".to_string())]);
        let backend = PbsBackend::new(Rc::new(runner.executor()));
        let mut job = job("md");
        job.remote_dir_name = "mdabcde".to_string();
        let outcome = backend.submit(&job, &resource("cluster")).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Submitted("1234.sdb".to_string()));
        let (_, args) = runner.calls().remove(0);
        assert_eq!(
            args.last().unwrap(),
            "cd /scratch/user/mdabcde && qsub submit.pbs"
        );
    }

    #[tokio::test]
    async fn submit_job_limit() {
        let runner = ScriptedRunner::with_outputs(vec![(
            38,
            String::new(),
            "qsub: would exceed queue generic's per-user limit of jobs in 'Q' state".to_string(),
        )]);
        let backend = PbsBackend::new(Rc::new(runner.executor()));
        let outcome = backend.submit(&job("md"), &resource("cluster")).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::AdmissionExhausted);
    }

    #[tokio::test]
    async fn submit_rejected() {
        let runner = ScriptedRunner::with_outputs(vec![(
            1,
            String::new(),
            "qsub: Job exceeds queue resource limits".to_string(),
        )]);
        let backend = PbsBackend::new(Rc::new(runner.executor()));
        let error = backend
            .submit(&job("md"), &resource("cluster"))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("exceed the limits of the queue"));
    }

    #[tokio::test]
    async fn status_from_listing() {
        let listing = r#"
sdb:
                                                            Req'd  Req'd   Elap
Job ID          Username Queue    Jobname    SessID NDS TSK Memory Time  S Time
--------------- -------- -------- ---------- ------ --- --- ------ ----- - -----
1233.sdb        user     standard other       1111   2  48    --  02:00 R 00:10
1234.sdb        user     standard md          2222   2  48    --  02:30 H   --
"#;
        let runner = ScriptedRunner::new(vec![(0, listing.to_string()), (0, String::new())]);
        let backend = PbsBackend::new(Rc::new(runner.executor()));
        let mut job = job("md");
        job.remote_id = Some("1234.sdb".to_string());
        let resource = resource("cluster");
        assert_eq!(backend.status(&job, &resource).await.unwrap(), RawState::Held);
        assert_eq!(
            backend.status(&job, &resource).await.unwrap(),
            RawState::Finished
        );
        let (_, args) = runner.calls().remove(0);
        assert_eq!(args.last().unwrap(), "qstat -u user");
    }

    #[tokio::test]
    async fn delete_gone_job() {
        let runner = ScriptedRunner::with_outputs(vec![(
            153,
            String::new(),
            "qdel: Unknown Job Id 1234.sdb".to_string(),
        )]);
        let backend = PbsBackend::new(Rc::new(runner.executor()));
        let mut job = job("md");
        job.remote_id = Some("1234.sdb".to_string());
        backend.delete(&job, &resource("cluster")).await.unwrap();
        let (_, args) = runner.calls().remove(0);
        assert_eq!(args.last().unwrap(), "qdel 1234.sdb");
    }
}
