use std::collections::BTreeMap;
use std::fmt::Display;
use std::rc::Rc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::common::error::HpcError;
use crate::common::strutils::pluralize;
use crate::common::timeutils::now_monotonic;
use crate::engine::config::ERROR_REPORT_THRESHOLD;
use crate::engine::timer::TickTimer;
use crate::engine::{EngineOptions, RunSummary};
use crate::job::{Job, Resource, Status};
use crate::recovery::{RecoverySnapshot, RecoveryStore, ResourceRecord};
use crate::remote::RemoteExecutor;
use crate::scheduler::{
    SchedulerBackend, SubmitOutcome, create_backend, prepare_submission_script, probe_family,
};
use crate::staging::{CleanupOutcome, StagingCoordinator, StagingError};
use crate::{Map, ResourceId, Set};

enum LoopEnd {
    AllTerminal,
    Cancelled,
}

#[derive(Default)]
struct PollOutcome {
    changed: bool,
    /// At least one job has left the queue.
    finished: bool,
}

/// Drives jobs through their lifecycle.
///
/// Remote calls of a single tick run concurrently, their results are applied to the
/// engine state one by one after all of them have finished.
pub struct OrchestrationEngine {
    jobs: Vec<Job>,
    resources: Map<ResourceId, Resource>,
    backends: Map<ResourceId, Rc<dyn SchedulerBackend>>,
    admission: AdmissionController,
    executor: Rc<RemoteExecutor>,
    staging: StagingCoordinator,
    recovery: Option<RecoveryStore>,
    options: EngineOptions,
}

impl OrchestrationEngine {
    pub fn new(
        executor: Rc<RemoteExecutor>,
        resources: Vec<Resource>,
        jobs: Vec<Job>,
        options: EngineOptions,
    ) -> crate::Result<Self> {
        let resources: Map<ResourceId, Resource> = resources
            .into_iter()
            .map(|resource| (resource.name.clone(), resource))
            .collect();
        {
            let mut names = Set::default();
            for job in &jobs {
                if !resources.contains_key(&job.resource) {
                    return Err(HpcError::InvalidJobDefinition(format!(
                        "Job `{}` refers to an unknown resource `{}`",
                        job.name, job.resource
                    )));
                }
                if !names.insert(job.name.as_str()) {
                    return Err(HpcError::InvalidJobDefinition(format!(
                        "Job name `{}` is used more than once",
                        job.name
                    )));
                }
            }
        }

        Ok(Self {
            jobs,
            resources,
            backends: Map::default(),
            admission: AdmissionController::default(),
            staging: StagingCoordinator::new(executor.clone()),
            executor,
            recovery: None,
            options,
        })
    }

    /// Restores an engine from a recovery snapshot.
    ///
    /// Jobs known to the scheduler will be monitored, jobs which were not submitted yet
    /// will be prepared and submitted again.
    pub fn from_snapshot(
        executor: Rc<RemoteExecutor>,
        snapshot: RecoverySnapshot,
        options: EngineOptions,
    ) -> crate::Result<Self> {
        let mut resources = Vec::with_capacity(snapshot.resources.len());
        let mut states = Vec::with_capacity(snapshot.resources.len());
        for (name, record) in snapshot.resources {
            states.push((name, record.admission));
            resources.push(record.resource);
        }

        let mut engine = Self::new(executor, resources, snapshot.jobs, options)?;
        engine.admission = AdmissionController::from_states(states);

        for job in &mut engine.jobs {
            let missing_id = job.remote_id.as_deref().is_none_or(str::is_empty);
            if job.status == Status::Submitted || (job.status.has_remote_id() && missing_id) {
                log::warn!(
                    "Job `{}` does not have a remote job id, it will be submitted again",
                    job.name
                );
                job.reset_for_preparation();
            }
        }
        let resource_ids: Vec<ResourceId> = engine.resources.keys().cloned().collect();
        for resource_id in resource_ids {
            let slots = engine
                .jobs
                .iter()
                .filter(|job| job.resource == resource_id && job.status.holds_slot())
                .count();
            engine
                .admission
                .set_slots_in_use(&resource_id, slots as u32);
        }
        Ok(engine)
    }

    pub fn with_recovery(mut self, store: RecoveryStore) -> Self {
        self.recovery = Some(store);
        self
    }

    /// Uses the given backend for the resource instead of creating one from its scheduler
    /// family.
    pub fn set_backend(&mut self, resource: &str, backend: Rc<dyn SchedulerBackend>) {
        self.backends.insert(resource.to_string(), backend);
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        let resources: BTreeMap<ResourceId, ResourceRecord> = self
            .resources
            .iter()
            .map(|(name, resource)| {
                let record = ResourceRecord {
                    resource: resource.clone(),
                    admission: self.admission.state(name).cloned().unwrap_or_default(),
                };
                (name.clone(), record)
            })
            .collect();
        RecoverySnapshot::new(resources, self.jobs.clone())
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for job in &self.jobs {
            match job.status {
                Status::Complete => summary.complete += 1,
                Status::SubmitError => summary.submit_error += 1,
                _ => summary.incomplete += 1,
            }
        }
        summary
    }

    /// Submits all jobs which were not submitted yet, monitors them until they finish
    /// and retrieves their results.
    ///
    /// Cancellation is checked between ticks. Active jobs of a cancelled run are removed
    /// from their schedulers.
    pub async fn run(&mut self, cancel: &CancellationToken) -> crate::Result<RunSummary> {
        if self.options.disconnect && self.recovery.is_none() {
            return Err(HpcError::GenericError(
                "Disconnecting requires a recovery file".to_string(),
            ));
        }

        self.submit_all(cancel).await?;

        if self.options.disconnect {
            self.save_snapshot()?;
            log::info!("Jobs were submitted, monitoring can be resumed from the recovery file");
            return Ok(self.summary());
        }
        self.save_snapshot_best_effort();

        if let LoopEnd::Cancelled = self.monitor(cancel).await? {
            log::warn!("The run was cancelled, removing active jobs");
            self.abort_active_jobs().await?;
        }
        self.finalize().await;
        self.save_snapshot_best_effort();
        Ok(self.summary())
    }

    fn save_snapshot(&self) -> crate::Result<()> {
        if let Some(store) = &self.recovery {
            store.save(&self.snapshot())?;
        }
        Ok(())
    }

    fn save_snapshot_best_effort(&self) {
        if let Err(error) = self.save_snapshot() {
            log::error!("Cannot write recovery snapshot: {error}");
        }
    }

    fn resource_of(&self, job: &Job) -> crate::Result<&Resource> {
        self.resources.get(&job.resource).ok_or_else(|| {
            HpcError::InvalidJobDefinition(format!(
                "Job `{}` refers to an unknown resource `{}`",
                job.name, job.resource
            ))
        })
    }

    fn job_context(&self, index: usize) -> crate::Result<(Rc<dyn SchedulerBackend>, Resource)> {
        let job = &self.jobs[index];
        let backend = self.backends.get(&job.resource).cloned().ok_or_else(|| {
            HpcError::GenericError(format!(
                "No scheduler is available for resource `{}`",
                job.resource
            ))
        })?;
        Ok((backend, self.resource_of(job)?.clone()))
    }

    fn fail_submission(&mut self, index: usize, error: impl Display) {
        let job = &mut self.jobs[index];
        log::error!("Job `{}` could not be submitted: {error}", job.name);
        job.status = Status::SubmitError;
        job.remote_id = None;
        job.last_error = Some(error.to_string());
    }

    fn report_job_error(&mut self, index: usize, action: &str, error: impl Display) {
        let job = &mut self.jobs[index];
        let count = job.record_error(error.to_string());
        if count >= ERROR_REPORT_THRESHOLD {
            log::error!(
                "{action} of job `{}` failed {count} times in a row: {error}",
                job.name
            );
        } else {
            log::warn!("{action} of job `{}` failed: {error}", job.name);
        }
    }

    async fn resolve_backend(&mut self, resource_id: &str) -> crate::Result<Rc<dyn SchedulerBackend>> {
        let resource = self.resources.get(resource_id).ok_or_else(|| {
            HpcError::InvalidJobDefinition(format!("Unknown resource `{resource_id}`"))
        })?;
        let family = match resource.scheduler {
            Some(family) => family,
            None => {
                log::info!("Detecting the scheduler of resource `{resource_id}`");
                match probe_family(&self.executor, resource).await? {
                    Some(family) => family,
                    None => {
                        return Err(HpcError::PluginCapabilityMissing {
                            resource: resource_id.to_string(),
                            message: "none of the supported schedulers (LSF, SGE, SLURM, PBS) was detected".to_string(),
                        });
                    }
                }
            }
        };
        if let Some(resource) = self.resources.get_mut(resource_id) {
            resource.scheduler = Some(family);
        }
        Ok(create_backend(family, self.executor.clone()))
    }

    /// Finds the backend of every resource with unfinished jobs, probing each resource
    /// with an unknown scheduler once.
    async fn resolve_backends(&mut self) -> crate::Result<()> {
        let mut resource_ids: Vec<ResourceId> = self
            .jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| job.resource.clone())
            .collect();
        resource_ids.sort();
        resource_ids.dedup();

        for resource_id in resource_ids {
            if self.backends.contains_key(&resource_id) {
                continue;
            }
            match self.resolve_backend(&resource_id).await {
                Ok(backend) => {
                    self.backends.insert(resource_id, backend);
                }
                Err(error @ HpcError::PluginCapabilityMissing { .. }) => return Err(error),
                Err(error) => {
                    log::error!("Cannot detect the scheduler of resource `{resource_id}`: {error}");
                    let indices: Vec<usize> = self
                        .jobs
                        .iter()
                        .enumerate()
                        .filter(|(_, job)| {
                            job.resource == resource_id
                                && matches!(
                                    job.status,
                                    Status::Prepared | Status::Staged | Status::WaitingAdmission
                                )
                        })
                        .map(|(index, _)| index)
                        .collect();
                    for index in indices {
                        self.fail_submission(index, &error);
                    }
                }
            }
        }
        Ok(())
    }

    async fn submit_all(&mut self, cancel: &CancellationToken) -> crate::Result<()> {
        self.resolve_backends().await?;

        let pending: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| matches!(job.status, Status::Prepared | Status::Staged))
            .map(|(index, _)| index)
            .collect();
        if !pending.is_empty() {
            log::info!(
                "Submitting {} {}",
                pending.len(),
                pluralize("job", pending.len())
            );
        }
        for index in pending {
            if cancel.is_cancelled() {
                log::warn!("Submission was cancelled");
                break;
            }
            self.prepare_and_submit(index).await?;
        }
        Ok(())
    }

    /// Renders the submission script, stages the input files and submits the job.
    async fn prepare_and_submit(&mut self, index: usize) -> crate::Result<()> {
        let (backend, resource) = match self.job_context(index) {
            Ok(context) => context,
            Err(error) => {
                self.fail_submission(index, error);
                return Ok(());
            }
        };

        let job = &mut self.jobs[index];
        job.status = Status::Prepared;
        if job.remote_dir_name.is_empty() {
            job.assign_remote_dir_name();
        }
        if let Err(error) = prepare_submission_script(backend.as_ref(), job, &resource) {
            self.fail_submission(index, error);
            return Ok(());
        }

        let result = self.staging.push_initial(&self.jobs[index], &resource).await;
        match result {
            Ok(()) => {
                let job = &mut self.jobs[index];
                job.staged = true;
                job.status = Status::Staged;
            }
            Err(error) => {
                // The directory might have been created before the failure.
                if !matches!(error, StagingError::UnsafeDirectory { .. }) {
                    self.jobs[index].staged = true;
                }
                self.fail_submission(index, error);
                return Ok(());
            }
        }

        self.try_submit(index, &backend, &resource).await
    }

    /// Submits a staged job if its resource has a free slot.
    ///
    /// Only a backend without the submit capability makes this fail, every other error
    /// is recorded against the job.
    async fn try_submit(
        &mut self,
        index: usize,
        backend: &Rc<dyn SchedulerBackend>,
        resource: &Resource,
    ) -> crate::Result<()> {
        let resource_id = resource.name.as_str();
        if !self.admission.try_reserve_slot(resource_id) {
            let job = &mut self.jobs[index];
            if job.status != Status::WaitingAdmission {
                log::info!(
                    "Resource `{resource_id}` is at its job limit, job `{}` waits for a free slot",
                    job.name
                );
                job.status = Status::WaitingAdmission;
            }
            return Ok(());
        }

        self.jobs[index].status = Status::Submitted;
        let outcome = backend.submit(&self.jobs[index], resource).await;
        let job = &mut self.jobs[index];
        match outcome {
            Ok(SubmitOutcome::Submitted(remote_id)) => {
                self.admission.record_acceptance(resource_id);
                log::info!(
                    "Job `{}` was submitted to `{resource_id}` with id {remote_id}",
                    job.name
                );
                job.mark_submitted(remote_id);
            }
            Ok(SubmitOutcome::AdmissionExhausted) => {
                let slots = self.admission.record_rejection(resource_id);
                if slots == 0 {
                    let message = format!(
                        "Resource `{resource_id}` refused the job because of a job limit, although it runs no other jobs"
                    );
                    self.fail_submission(index, message);
                } else {
                    log::info!(
                        "Resource `{resource_id}` reached its job limit with {slots} {}, job `{}` waits for a free slot",
                        pluralize("job", slots as usize),
                        job.name
                    );
                    job.status = Status::WaitingAdmission;
                }
            }
            Err(error) => {
                self.admission.cancel_reservation(resource_id);
                if error.is_capability_missing() {
                    return Err(HpcError::PluginCapabilityMissing {
                        resource: resource_id.to_string(),
                        message: error.to_string(),
                    });
                }
                self.fail_submission(index, error);
            }
        }
        Ok(())
    }

    /// Largest poll and staging intervals among unfinished jobs.
    fn active_intervals(&self) -> Option<(Duration, Duration)> {
        self.jobs
            .iter()
            .filter(|job| !job.status.is_terminal())
            .map(|job| (job.poll_interval, job.staging_interval))
            .reduce(|(poll_a, stage_a), (poll_b, stage_b)| {
                (poll_a.max(poll_b), stage_a.max(stage_b))
            })
    }

    async fn monitor(&mut self, cancel: &CancellationToken) -> crate::Result<LoopEnd> {
        let mut poll_timer = TickTimer::new();
        let mut stage_timer = TickTimer::new();

        loop {
            let Some((poll_interval, stage_interval)) = self.active_intervals() else {
                log::info!("All jobs have finished");
                return Ok(LoopEnd::AllTerminal);
            };
            if cancel.is_cancelled() {
                return Ok(LoopEnd::Cancelled);
            }

            let now = now_monotonic();
            let mut changed = false;
            let mut stage_due = stage_timer.is_due(now, stage_interval);
            if poll_timer.is_due(now, poll_interval) {
                poll_timer.reset(now);
                let outcome = self.poll_tick().await?;
                changed |= outcome.changed;
                stage_due |= outcome.finished;
                changed |= self.retry_waiting_jobs().await?;
            }
            if stage_due {
                stage_timer.reset(now);
                changed |= self.stage_tick().await;
            }
            if changed {
                self.save_snapshot_best_effort();
            }

            let now = now_monotonic();
            let delay = poll_timer
                .remaining(now, poll_interval)
                .min(stage_timer.remaining(now, stage_interval))
                .max(self.options.min_tick);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    async fn poll_tick(&mut self) -> crate::Result<PollOutcome> {
        let indices: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status.is_pollable())
            .map(|(index, _)| index)
            .collect();
        let mut outcome = PollOutcome::default();
        if indices.is_empty() {
            return Ok(outcome);
        }
        log::debug!(
            "Checking status of {} {}",
            indices.len(),
            pluralize("job", indices.len())
        );

        let results = join_all(indices.iter().map(|&index| {
            let job = &self.jobs[index];
            let context = self.job_context(index);
            async move {
                let (backend, resource) = context?;
                backend
                    .status(job, &resource)
                    .await
                    .map_err(HpcError::from)
            }
        }))
        .await;

        for (index, result) in indices.into_iter().zip(results) {
            match result {
                Ok(raw) => {
                    let job = &mut self.jobs[index];
                    job.reset_errors();
                    let previous = job.status;
                    let next = previous.next(raw);
                    if next != previous {
                        log::info!("Job `{}`: {previous} -> {next}", job.name);
                        job.status = next;
                        outcome.changed = true;
                        if next == Status::Finished {
                            self.admission.release(&job.resource);
                            outcome.finished = true;
                        }
                    }
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => self.report_job_error(index, "Status check", error),
            }
        }
        Ok(outcome)
    }

    /// Attempts to submit jobs waiting for a free slot.
    async fn retry_waiting_jobs(&mut self) -> crate::Result<bool> {
        let waiting: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status == Status::WaitingAdmission)
            .map(|(index, _)| index)
            .collect();
        let mut changed = false;
        for index in waiting {
            let (backend, resource) = match self.job_context(index) {
                Ok(context) => context,
                Err(error) => {
                    self.fail_submission(index, error);
                    changed = true;
                    continue;
                }
            };
            self.try_submit(index, &backend, &resource).await?;
            changed |= self.jobs[index].status != Status::WaitingAdmission;
        }
        Ok(changed)
    }

    /// Downloads results of running jobs and final results of finished jobs.
    async fn stage_tick(&mut self) -> bool {
        let indices: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| matches!(job.status, Status::Running | Status::Finished))
            .map(|(index, _)| index)
            .collect();
        if indices.is_empty() {
            return false;
        }

        let staging = &self.staging;
        let results = join_all(indices.iter().map(|&index| {
            let job = &self.jobs[index];
            let resource = self.resource_of(job);
            async move {
                let resource = resource?;
                if job.status == Status::Finished {
                    staging.pull_final(job, resource).await?;
                } else {
                    staging.pull_incremental(job, resource).await?;
                }
                Ok::<_, HpcError>(())
            }
        }))
        .await;

        let mut changed = false;
        for (index, result) in indices.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    let job = &mut self.jobs[index];
                    job.reset_errors();
                    if job.status == Status::Finished {
                        log::info!("Job `{}` is complete", job.name);
                        job.status = Status::Complete;
                        changed = true;
                    }
                }
                Err(error) => self.report_job_error(index, "Staging", error),
            }
        }
        changed
    }

    /// Removes jobs from their schedulers and saves their partial results.
    async fn abort_active_jobs(&mut self) -> crate::Result<()> {
        let active: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status.is_pollable())
            .map(|(index, _)| index)
            .collect();

        let results = join_all(active.iter().map(|&index| {
            let job = &self.jobs[index];
            let context = self.job_context(index);
            async move {
                let (backend, resource) = context?;
                backend
                    .delete(job, &resource)
                    .await
                    .map_err(HpcError::from)
            }
        }))
        .await;
        for (&index, result) in active.iter().zip(results) {
            let name = &self.jobs[index].name;
            match result {
                Ok(()) => log::info!("Job `{name}` was cancelled"),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => log::error!("Cannot cancel job `{name}`: {error}"),
            }
        }

        let submitted: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| {
                job.staged && job.status.has_remote_id() && job.status != Status::Complete
            })
            .map(|(index, _)| index)
            .collect();
        let staging = &self.staging;
        let results = join_all(submitted.iter().map(|&index| {
            let job = &self.jobs[index];
            let resource = self.resource_of(job);
            async move {
                staging.pull_incremental(job, resource?).await?;
                Ok::<_, HpcError>(())
            }
        }))
        .await;
        for (&index, result) in submitted.iter().zip(results) {
            if let Err(error) = result {
                log::warn!(
                    "Cannot download partial results of job `{}`: {error}",
                    self.jobs[index].name
                );
            }
        }
        Ok(())
    }

    /// Collects results which were not downloaded yet and removes remote directories.
    async fn finalize(&mut self) {
        let finished: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.status == Status::Finished)
            .map(|(index, _)| index)
            .collect();
        let staging = &self.staging;
        let results = join_all(finished.iter().map(|&index| {
            let job = &self.jobs[index];
            let resource = self.resource_of(job);
            async move {
                staging.pull_final(job, resource?).await?;
                Ok::<_, HpcError>(())
            }
        }))
        .await;
        for (index, result) in finished.into_iter().zip(results) {
            let job = &mut self.jobs[index];
            match result {
                Ok(()) => {
                    log::info!("Job `{}` is complete", job.name);
                    job.status = Status::Complete;
                }
                Err(error) => log::error!(
                    "Cannot download final results of job `{}`: {error}",
                    job.name
                ),
            }
        }

        let staged: Vec<usize> = self
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.staged)
            .map(|(index, _)| index)
            .collect();
        let staging = &self.staging;
        let results = join_all(staged.iter().map(|&index| {
            let job = &self.jobs[index];
            let resource = self.resource_of(job);
            async move { Ok::<_, HpcError>(staging.cleanup(job, resource?).await?) }
        }))
        .await;
        for (index, result) in staged.into_iter().zip(results) {
            let job = &mut self.jobs[index];
            match result {
                Ok(CleanupOutcome::Removed) | Ok(CleanupOutcome::Refused) => job.staged = false,
                Err(error) => log::error!("{error}"),
            }
        }
    }
}
