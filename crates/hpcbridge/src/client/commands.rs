use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::client::cli::{RecoverOpts, ScriptOpts, StatusOpts, SubmitOpts};
use crate::client::globalsettings::GlobalSettings;
use crate::common::fsutils::absolute_path;
use crate::engine::{EngineOptions, OrchestrationEngine};
use crate::jobfile::JobFile;
use crate::recovery::RecoveryStore;
use crate::remote::{ProcessRunner, RemoteExecutor, RetryPolicy};
use crate::scheduler::create_backend;

/// `jobs.toml` -> `jobs.recovery.toml`
fn default_recovery_path(jobfile: &Path) -> PathBuf {
    jobfile.with_extension("recovery.toml")
}

fn load_jobfile(path: &Path) -> anyhow::Result<JobFile> {
    JobFile::load(path).with_context(|| format!("Cannot load job file {}", path.display()))
}

/// Runs the engine until it finishes, cancelling it on Ctrl-C.
async fn run_engine(gsettings: &GlobalSettings, mut engine: OrchestrationEngine) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let result = {
        let run = engine.run(&cancel);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                log::warn!("Interrupted, cancelling active jobs and downloading their results");
                cancel.cancel();
                run.await
            }
        }
    };

    gsettings.printer().print_job_list(engine.jobs());
    let summary = result?;
    gsettings.printer().print_summary(&summary);
    Ok(())
}

pub async fn command_submit(gsettings: &GlobalSettings, opts: SubmitOpts) -> anyhow::Result<()> {
    let path = absolute_path(opts.jobfile);
    let jobfile = load_jobfile(&path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let (resources, jobs) = jobfile.into_parts(&base_dir);

    let recovery_path = opts
        .recovery_file
        .map(absolute_path)
        .unwrap_or_else(|| default_recovery_path(&path));
    log::info!("Job states are stored in {}", recovery_path.display());

    let executor = Rc::new(RemoteExecutor::from_env()?);
    let options = EngineOptions {
        disconnect: opts.disconnect,
        ..Default::default()
    };
    let engine = OrchestrationEngine::new(executor, resources, jobs, options)?
        .with_recovery(RecoveryStore::new(recovery_path));
    run_engine(gsettings, engine).await
}

pub async fn command_recover(gsettings: &GlobalSettings, opts: RecoverOpts) -> anyhow::Result<()> {
    let store = RecoveryStore::new(absolute_path(opts.recovery_file));
    let snapshot = store.load()?;
    log::info!(
        "Resuming {} job(s) from {}",
        snapshot.jobs.len(),
        store.path().display()
    );

    let executor = Rc::new(RemoteExecutor::from_env()?);
    let engine = OrchestrationEngine::from_snapshot(executor, snapshot, EngineOptions::default())?
        .with_recovery(store);
    run_engine(gsettings, engine).await
}

pub fn command_status(gsettings: &GlobalSettings, opts: StatusOpts) -> anyhow::Result<()> {
    let store = RecoveryStore::new(absolute_path(opts.recovery_file));
    let snapshot = store.load()?;
    gsettings.printer().print_snapshot(store.path(), &snapshot);
    Ok(())
}

pub fn command_script(gsettings: &GlobalSettings, opts: ScriptOpts) -> anyhow::Result<()> {
    let path = absolute_path(opts.jobfile);
    let jobfile = load_jobfile(&path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let (resources, jobs) = jobfile.into_parts(&base_dir);

    // Rendering a script never runs a remote command
    let executor = Rc::new(RemoteExecutor::new(
        Box::new(ProcessRunner),
        RetryPolicy::default(),
        "ssh".to_string(),
        "rsync".to_string(),
    ));

    let mut printed = false;
    for job in &jobs {
        if opts.job.as_ref().is_some_and(|name| name != &job.name) {
            continue;
        }
        let resource = resources
            .iter()
            .find(|resource| resource.name == job.resource)
            .with_context(|| format!("Unknown resource `{}`", job.resource))?;
        let family = resource.scheduler.or(opts.scheduler).with_context(|| {
            format!(
                "Resource `{}` does not specify a scheduler, use `--scheduler`",
                resource.name
            )
        })?;
        let backend = create_backend(family, executor.clone());
        let script = backend.build_submission_script(job, resource)?;
        gsettings.printer().print_script(job, family.name(), &script);
        printed = true;
    }
    if !printed {
        if let Some(name) = opts.job {
            anyhow::bail!("Job `{name}` was not found in {}", path.display());
        }
    }
    Ok(())
}
