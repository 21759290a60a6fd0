//! Orchestrator: public job operations on top of the store, the task queue,
//! the concurrency gate and the runners.
//!
//! `submit` returns as soon as records exist and units are queued.
//! `suspend` and `resume` block until the persisted status settles; the
//! wait is driven by lifecycle-hook notifications and bounded by the
//! configured timeout.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use raptgen_core::{ComputeDevice, DeviceInventory, Error, GateConfig, RaptgenConfig, Result};
use raptgen_store::{
    JobFilter, JobStatus, NewParentJob, NewSweepJob, ParentJob, SqliteStore, SweepJob,
};
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::em::EmFitter;
use crate::gate::ConcurrencyGate;
use crate::hooks::LifecycleHooks;
use crate::process_trainer::ProcessTrainerFactory;
use crate::queue::TaskQueue;
use crate::sweep::{MixtureFitter, SweepRunner};
use crate::trainer::{TrainerFactory, TrainingParams};
use crate::training::TrainingRunner;
use crate::types::*;

fn log_hook_error(result: Result<()>) {
    if let Err(e) = result {
        error!("Lifecycle hook failed: {}", e);
    }
}

fn compile_regex(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| {
            Regex::new(p).map_err(|e| Error::InvalidInput(format!("invalid regular expression: {}", e)))
        })
        .transpose()
}

fn require_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::InvalidInput("name must not be empty".into()));
    }
    Ok(name.to_string())
}

pub struct Orchestrator {
    store: Arc<SqliteStore>,
    hooks: Arc<LifecycleHooks>,
    gate: Arc<ConcurrencyGate>,
    queue: TaskQueue,
    training: Arc<TrainingRunner>,
    sweeps: Arc<SweepRunner>,
    devices: DeviceInventory,
    wait_timeout: Duration,
    /// One lock per job id; suspend, resume and delete of the same job
    /// run one at a time.
    controls: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        gates: GateConfig,
        wait_timeout: Duration,
        factory: Arc<dyn TrainerFactory>,
        fitter: Arc<dyn MixtureFitter>,
    ) -> Self {
        let hooks = Arc::new(LifecycleHooks::new(Arc::clone(&store)));
        let training = Arc::new(TrainingRunner::new(
            Arc::clone(&store),
            Arc::clone(&hooks),
            factory,
        ));
        let sweeps = Arc::new(SweepRunner::new(Arc::clone(&store), Arc::clone(&hooks), fitter));
        let devices = DeviceInventory::discover();

        info!(
            "Orchestrator initialized: devices={:?}, gate capacity={}, wait timeout={}s",
            devices.names(),
            gates.default_capacity,
            wait_timeout.as_secs()
        );

        Self {
            store,
            hooks,
            gate: Arc::new(ConcurrencyGate::new(gates)),
            queue: TaskQueue::new(),
            training,
            sweeps,
            devices,
            wait_timeout,
            controls: DashMap::new(),
        }
    }

    /// Orchestrator using the external trainer process and the EM fitter.
    pub fn from_config(store: Arc<SqliteStore>, config: &RaptgenConfig) -> Self {
        Self::new(
            store,
            config.gates.clone(),
            config.wait_timeout,
            Arc::new(ProcessTrainerFactory::new(config.trainer.clone())),
            Arc::new(EmFitter::new()),
        )
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    pub fn hooks(&self) -> &Arc<LifecycleHooks> {
        &self.hooks
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn devices(&self) -> &DeviceInventory {
        &self.devices
    }

    fn require_parent(&self, parent_id: &str) -> Result<ParentJob> {
        self.store
            .get_parent(parent_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", parent_id)))
    }

    fn require_sweep(&self, sweep_id: &str) -> Result<SweepJob> {
        self.store
            .get_sweep(sweep_id)?
            .ok_or_else(|| Error::NotFound(format!("sweep {}", sweep_id)))
    }

    fn control_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.controls.entry(id.to_string()).or_default().value())
    }

    /// Re-check `check` after every lifecycle event until it yields a value.
    async fn wait_until<T, F>(&self, what: &str, mut check: F) -> Result<T>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let mut rx = self.hooks.subscribe();
        let wait = async {
            loop {
                match check() {
                    Ok(Some(value)) => return Ok(value),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Internal("lifecycle channel closed".into()));
                }
            }
        };
        tokio::time::timeout(self.wait_timeout, wait)
            .await
            .map_err(|_| {
                Error::Timeout(format!("{} after {}s", what, self.wait_timeout.as_secs()))
            })?
    }

    // ---------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------

    /// Assign a fresh worker id to a new work-unit and queue it.
    fn dispatch_unit(&self, child_id: &str, class: String) -> Result<()> {
        let worker_id = uuid::Uuid::new_v4().to_string();
        self.store.set_child_worker(child_id, &worker_id)?;
        self.spawn_unit(child_id, &worker_id, class, false);
        Ok(())
    }

    /// Queue one work-unit under `worker_id`. The task waits for a gate slot
    /// unless it is cancelled first, in which case the unit is reported
    /// suspended.
    fn spawn_unit(&self, child_id: &str, worker_id: &str, class: String, resume: bool) {
        let gate = Arc::clone(&self.gate);
        let hooks = Arc::clone(&self.hooks);
        let runner = Arc::clone(&self.training);
        let child_id = child_id.to_string();
        debug!(
            "Queueing work-unit {} as task {} on {} ({} tasks live)",
            child_id,
            worker_id,
            class,
            self.queue.live()
        );

        self.queue.enqueue(worker_id, move |cancel| async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log_hook_error(hooks.on_suspend(&child_id));
                    return;
                }
                permit = gate.acquire(&class) => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    log_hook_error(hooks.on_failure(&child_id, &e.to_string()));
                    return;
                }
            };
            debug!(
                "Work-unit {} admitted to {} ({}/{} in flight)",
                child_id,
                permit.class(),
                gate.in_flight(&class),
                gate.capacity(&class)
            );

            let id = child_id.clone();
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                runner.run(&id, resume, &cancel)
            })
            .await;
            match result {
                Ok(Ok(outcome)) => debug!("Work-unit {} ended: {:?}", child_id, outcome),
                Ok(Err(e)) => debug!("Work-unit {} ended with error: {}", child_id, e),
                Err(e) => log_hook_error(
                    hooks.on_failure(&child_id, &format!("worker panicked: {}", e)),
                ),
            }
        });
    }

    fn dispatch_sweep(&self, sweep_id: &str) -> Result<()> {
        let worker_id = uuid::Uuid::new_v4().to_string();
        self.store.set_sweep_worker(sweep_id, &worker_id)?;
        self.spawn_sweep(sweep_id, &worker_id);
        Ok(())
    }

    fn spawn_sweep(&self, sweep_id: &str, worker_id: &str) {
        let gate = Arc::clone(&self.gate);
        let hooks = Arc::clone(&self.hooks);
        let runner = Arc::clone(&self.sweeps);
        let sweep_id = sweep_id.to_string();
        let class = ComputeDevice::Cpu.resource_class();

        self.queue.enqueue(worker_id, move |cancel| async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log_hook_error(hooks.on_sweep_suspend(&sweep_id));
                    return;
                }
                permit = gate.acquire(&class) => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    log_hook_error(hooks.on_sweep_failure(&sweep_id, &e.to_string()));
                    return;
                }
            };

            let id = sweep_id.clone();
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                runner.run(&id, &cancel)
            })
            .await;
            match result {
                Ok(Ok(outcome)) => debug!("Sweep {} ended: {:?}", sweep_id, outcome),
                Ok(Err(e)) => debug!("Sweep {} ended with error: {}", sweep_id, e),
                Err(e) => log_hook_error(
                    hooks.on_sweep_failure(&sweep_id, &format!("worker panicked: {}", e)),
                ),
            }
        });
    }

    // ---------------------------------------------------------------
    // Training jobs
    // ---------------------------------------------------------------

    /// Persist a parent with `reiteration` pending units and queue them all.
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, submission: TrainingSubmission) -> Result<String> {
        let name = require_name(&submission.name)?;
        if submission.reiteration == 0 {
            return Err(Error::InvalidInput("reiteration must be >= 1".into()));
        }
        if submission.random_regions.is_empty() {
            return Err(Error::InvalidInput("random_regions must not be empty".into()));
        }
        if !submission.duplicates.is_empty()
            && submission.duplicates.len() != submission.random_regions.len()
        {
            return Err(Error::InvalidInput(
                "duplicates must have one entry per random region".into(),
            ));
        }

        let params_blob = serde_json::json!({
            "params_training": submission.params_training,
            "params_preprocessing": submission.params_preprocessing,
        });
        let params = TrainingParams::from_job_params(&params_blob)?;
        if !self.devices.contains(params.device) {
            return Err(Error::InvalidInput(format!(
                "device {} is not available",
                params.device
            )));
        }

        let parent_id = self.store.create_parent(&NewParentJob {
            name,
            kind: submission.kind,
            reiteration: submission.reiteration,
            steps_total: params.epochs,
            params: params_blob,
            random_regions: submission.random_regions,
            duplicates: submission.duplicates,
        })?;

        let class = params.device.resource_class();
        for child in self.store.list_children(&parent_id)? {
            self.dispatch_unit(&child.id, class.clone())?;
        }
        info!(
            "Submitted job {} ({}): {} work-units x {} epochs on {}",
            parent_id, submission.kind, submission.reiteration, params.epochs, class
        );
        Ok(parent_id)
    }

    /// Ask every active unit to stop at its next step boundary and wait
    /// until the parent is no longer pending or in progress.
    pub async fn suspend(&self, parent_id: &str) -> Result<ParentJob> {
        let control = self.control_lock(parent_id);
        let _held = control.lock().await;
        self.suspend_held(parent_id).await
    }

    async fn suspend_held(&self, parent_id: &str) -> Result<ParentJob> {
        let parent = self.require_parent(parent_id)?;
        if parent.status != JobStatus::Progress {
            return Err(Error::InvalidState(format!(
                "job {} is {}; only a job in progress can be suspended",
                parent_id, parent.status
            )));
        }

        let mut signalled = 0;
        for child in self.store.list_children(parent_id)? {
            if !child.status.is_active() {
                continue;
            }
            let live = child
                .worker_id
                .as_deref()
                .map(|w| self.queue.cancel(w))
                .unwrap_or(false);
            if live {
                signalled += 1;
                continue;
            }
            // No task owns the unit any more
            self.hooks
                .on_orphan_suspend(&child.id, child.worker_id.as_deref())?;
        }
        info!("Suspending job {}: {} work-units signalled", parent_id, signalled);

        self.wait_until(&format!("suspending job {}", parent_id), || {
            let parent = self.require_parent(parent_id)?;
            Ok((!parent.status.is_active()).then_some(parent))
        })
        .await
    }

    /// Re-queue every suspended unit with the resume flag and wait until the
    /// parent leaves `suspend`.
    pub async fn resume(&self, parent_id: &str) -> Result<ParentJob> {
        let control = self.control_lock(parent_id);
        let _held = control.lock().await;

        let parent = self.require_parent(parent_id)?;
        if parent.status != JobStatus::Suspend {
            return Err(Error::InvalidState(format!(
                "job {} is {}; only a suspended job can be resumed",
                parent_id, parent.status
            )));
        }
        let params = TrainingParams::from_job_params(&parent.params)?;
        let class = params.device.resource_class();

        let mut queued = 0;
        for child in self.store.list_children(parent_id)? {
            if child.status != JobStatus::Suspend {
                continue;
            }
            let worker_id = uuid::Uuid::new_v4().to_string();
            if self.hooks.on_requeued(&child.id, &worker_id)? {
                self.spawn_unit(&child.id, &worker_id, class.clone(), true);
                queued += 1;
            }
        }
        if queued == 0 {
            return Err(Error::InvalidState(format!(
                "job {} has no suspended work-units left to resume",
                parent_id
            )));
        }
        info!("Resuming job {}: {} work-units queued", parent_id, queued);

        self.wait_until(&format!("resuming job {}", parent_id), || {
            let parent = self.require_parent(parent_id)?;
            Ok((parent.status != JobStatus::Suspend).then_some(parent))
        })
        .await
    }

    /// Delete a job with all of its units, logs, checkpoints and sequences.
    /// A job in progress is suspended first.
    pub async fn delete(&self, parent_id: &str) -> Result<()> {
        let control = self.control_lock(parent_id);
        let _held = control.lock().await;

        let parent = self.require_parent(parent_id)?;
        if parent.status == JobStatus::Progress {
            match self.suspend_held(parent_id).await {
                Ok(_) => {}
                Err(Error::Timeout(msg)) | Err(Error::InvalidState(msg)) => {
                    warn!("Deleting job {} without a clean suspend: {}", parent_id, msg)
                }
                Err(e) => return Err(e),
            }
        }
        for child in self.store.list_children(parent_id)? {
            if let Some(worker_id) = &child.worker_id {
                self.queue.cancel(worker_id);
            }
        }
        self.store.delete_parent(parent_id)?;
        self.controls.remove(parent_id);
        info!("Deleted job {}", parent_id);
        Ok(())
    }

    /// Block until the job is no longer pending or in progress.
    pub async fn wait_for_parent(&self, parent_id: &str) -> Result<ParentJob> {
        self.wait_until(&format!("waiting for job {}", parent_id), || {
            let parent = self.require_parent(parent_id)?;
            Ok((!parent.status.is_active()).then_some(parent))
        })
        .await
    }

    pub fn rename(&self, parent_id: &str, name: &str) -> Result<ParentJob> {
        let name = require_name(name)?;
        if !self.store.rename_parent(parent_id, &name)? {
            return Err(Error::NotFound(format!("job {}", parent_id)));
        }
        self.require_parent(parent_id)
    }

    pub fn search(&self, query: &JobSearch) -> Result<Vec<ParentJob>> {
        let regex = compile_regex(query.search_regex.as_deref())?;
        let jobs = self.store.list_parents(&JobFilter {
            statuses: query.statuses.clone(),
            kinds: query.kinds.clone(),
            multiple: query.is_multiple,
        })?;
        Ok(jobs
            .into_iter()
            .filter(|job| regex.as_ref().map_or(true, |r| r.is_match(&job.name)))
            .collect())
    }

    pub fn parent_detail(&self, parent_id: &str) -> Result<ParentDetail> {
        let job = self.require_parent(parent_id)?;
        let summary = self
            .store
            .list_children(parent_id)?
            .iter()
            .map(ChildSummary::from)
            .collect();
        Ok(ParentDetail {
            duration_secs: job.duration_secs(raptgen_core::now_secs()),
            job,
            summary,
        })
    }

    pub fn child_detail(&self, parent_id: &str, index: u32) -> Result<ChildDetail> {
        let child = self
            .store
            .get_child_by_index(parent_id, index)?
            .ok_or_else(|| Error::NotFound(format!("work-unit {} of job {}", index, parent_id)))?;

        let running = matches!(child.status, JobStatus::Progress | JobStatus::Suspend);
        let has_results = running || child.status == JobStatus::Success;
        let latent = if has_results {
            Some(self.store.list_embeddings(&child.id)?)
        } else {
            None
        };
        let losses = if has_results {
            Some(self.store.list_progress_log(&child.id)?)
        } else {
            None
        };

        Ok(ChildDetail {
            steps_completed: running.then_some(child.steps_completed),
            error: if child.status == JobStatus::Failure {
                child.error_msg
            } else {
                None
            },
            uuid: child.id,
            index: child.index,
            status: child.status,
            steps_total: child.steps_total,
            best_metric: child.best_metric,
            latent,
            losses,
        })
    }

    // ---------------------------------------------------------------
    // BIC sweeps
    // ---------------------------------------------------------------

    /// Persist a sweep over the latent coordinates of `target_child_id` and
    /// queue it. Must be called from within a Tokio runtime.
    pub fn submit_sweep(&self, sweep: NewSweepJob) -> Result<String> {
        let sweep = NewSweepJob {
            name: require_name(&sweep.name)?,
            ..sweep
        };
        sweep.validate()?;
        if self.store.get_child(&sweep.target_child_id)?.is_none() {
            return Err(Error::NotFound(format!("work-unit {}", sweep.target_child_id)));
        }
        if self.store.list_embeddings(&sweep.target_child_id)?.is_empty() {
            return Err(Error::InvalidState(format!(
                "work-unit {} has no latent coordinates yet",
                sweep.target_child_id
            )));
        }

        let sweep_id = self.store.create_sweep(&sweep)?;
        self.dispatch_sweep(&sweep_id)?;
        info!(
            "Submitted sweep {}: components {}..={} step {} x {} trials",
            sweep_id,
            sweep.min_components,
            sweep.max_components,
            sweep.step_size,
            sweep.trials_per_component
        );
        Ok(sweep_id)
    }

    pub async fn suspend_sweep(&self, sweep_id: &str) -> Result<SweepJob> {
        let control = self.control_lock(sweep_id);
        let _held = control.lock().await;
        self.suspend_sweep_held(sweep_id).await
    }

    async fn suspend_sweep_held(&self, sweep_id: &str) -> Result<SweepJob> {
        let sweep = self.require_sweep(sweep_id)?;
        if sweep.status != JobStatus::Progress {
            return Err(Error::InvalidState(format!(
                "sweep {} is {}; only a sweep in progress can be suspended",
                sweep_id, sweep.status
            )));
        }
        let live = sweep
            .worker_id
            .as_deref()
            .map(|w| self.queue.cancel(w))
            .unwrap_or(false);
        if !live {
            self.hooks
                .on_orphan_sweep_suspend(sweep_id, sweep.worker_id.as_deref())?;
        }
        info!("Suspending sweep {}", sweep_id);

        self.wait_until(&format!("suspending sweep {}", sweep_id), || {
            let sweep = self.require_sweep(sweep_id)?;
            Ok((!sweep.status.is_active()).then_some(sweep))
        })
        .await
    }

    pub async fn resume_sweep(&self, sweep_id: &str) -> Result<SweepJob> {
        let control = self.control_lock(sweep_id);
        let _held = control.lock().await;

        let sweep = self.require_sweep(sweep_id)?;
        if sweep.status != JobStatus::Suspend {
            return Err(Error::InvalidState(format!(
                "sweep {} is {}; only a suspended sweep can be resumed",
                sweep_id, sweep.status
            )));
        }
        let worker_id = uuid::Uuid::new_v4().to_string();
        if !self.hooks.on_sweep_requeued(sweep_id, &worker_id)? {
            return Err(Error::InvalidState(format!(
                "sweep {} is no longer suspended",
                sweep_id
            )));
        }
        self.spawn_sweep(sweep_id, &worker_id);
        info!("Resuming sweep {}", sweep_id);

        self.wait_until(&format!("resuming sweep {}", sweep_id), || {
            let sweep = self.require_sweep(sweep_id)?;
            Ok((sweep.status != JobStatus::Suspend).then_some(sweep))
        })
        .await
    }

    pub async fn delete_sweep(&self, sweep_id: &str) -> Result<()> {
        let control = self.control_lock(sweep_id);
        let _held = control.lock().await;

        let sweep = self.require_sweep(sweep_id)?;
        if sweep.status == JobStatus::Progress {
            match self.suspend_sweep_held(sweep_id).await {
                Ok(_) => {}
                Err(Error::Timeout(msg)) | Err(Error::InvalidState(msg)) => {
                    warn!("Deleting sweep {} without a clean suspend: {}", sweep_id, msg)
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(worker_id) = &sweep.worker_id {
            self.queue.cancel(worker_id);
        }
        self.store.delete_sweep(sweep_id)?;
        self.controls.remove(sweep_id);
        info!("Deleted sweep {}", sweep_id);
        Ok(())
    }

    pub async fn wait_for_sweep(&self, sweep_id: &str) -> Result<SweepJob> {
        self.wait_until(&format!("waiting for sweep {}", sweep_id), || {
            let sweep = self.require_sweep(sweep_id)?;
            Ok((!sweep.status.is_active()).then_some(sweep))
        })
        .await
    }

    pub fn rename_sweep(&self, sweep_id: &str, name: &str) -> Result<SweepJob> {
        let name = require_name(name)?;
        if !self.store.rename_sweep(sweep_id, &name)? {
            return Err(Error::NotFound(format!("sweep {}", sweep_id)));
        }
        self.require_sweep(sweep_id)
    }

    pub fn search_sweeps(&self, query: &SweepSearch) -> Result<Vec<SweepJob>> {
        let regex = compile_regex(query.search_regex.as_deref())?;
        let sweeps = self.store.list_sweeps(query.statuses.as_deref())?;
        Ok(sweeps
            .into_iter()
            .filter(|sweep| regex.as_ref().map_or(true, |r| r.is_match(&sweep.name)))
            .collect())
    }

    /// Sweep view; `n_components` selects a component count instead of the
    /// lowest-BIC one.
    pub fn sweep_detail(&self, sweep_id: &str, n_components: Option<u32>) -> Result<SweepDetail> {
        let job = self.require_sweep(sweep_id)?;
        let running = matches!(job.status, JobStatus::Progress | JobStatus::Suspend);
        let has_results = running || job.status == JobStatus::Success;

        let current = if running {
            self.store
                .get_trial(sweep_id, job.current_components)?
                .map(|t| SweepCursor {
                    n_components: t.n_components,
                    trials_completed: t.trials_completed,
                    trials_total: t.trials_total,
                })
        } else {
            None
        };

        let (selected, bic_scores) = if has_results {
            let selected = match n_components {
                Some(n) => Some(self.store.get_trial(sweep_id, n)?.ok_or_else(|| {
                    Error::NotFound(format!("sweep {} has no {}-component trial", sweep_id, n))
                })?),
                None => self.store.best_trial(sweep_id)?,
            };
            (selected, Some(self.store.list_bic_scores(sweep_id)?))
        } else {
            (None, None)
        };

        Ok(SweepDetail {
            duration_secs: job.duration_secs(raptgen_core::now_secs()),
            job,
            current,
            selected,
            bic_scores,
        })
    }

    // ---------------------------------------------------------------
    // Restart recovery
    // ---------------------------------------------------------------

    /// Mark every unit and sweep left pending or in progress by a previous
    /// process as suspended, so it can be resumed. Call once at startup,
    /// before anything is dispatched.
    pub fn recover_stranded(&self) -> Result<usize> {
        let stranded = [JobStatus::Pending, JobStatus::Progress];
        let mut count = 0;
        for child in self.store.list_children_by_status(&stranded)? {
            self.hooks.on_suspend(&child.id)?;
            count += 1;
        }
        for sweep in self.store.list_sweeps(Some(&stranded[..]))? {
            self.hooks.on_sweep_suspend(&sweep.id)?;
            count += 1;
        }
        if count > 0 {
            warn!("Marked {} stranded work-units and sweeps as suspended", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::MixtureFit;
    use crate::training::tests::{training_params, ScriptedFactory};
    use raptgen_store::{JobKind, LatentPoint, MixtureParams};
    use std::collections::HashMap;
    use tokio::sync::Barrier;

    fn orchestrator_with(
        factory: ScriptedFactory,
        fitter: Arc<dyn MixtureFitter>,
        capacity: usize,
    ) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let orchestrator = Orchestrator::new(
            store,
            GateConfig {
                default_capacity: capacity,
                overrides: HashMap::new(),
            },
            Duration::from_secs(10),
            Arc::new(factory),
            fitter,
        );
        (orchestrator, dir)
    }

    fn orchestrator(factory: ScriptedFactory, capacity: usize) -> (Orchestrator, tempfile::TempDir) {
        orchestrator_with(factory, Arc::new(EmFitter::new()), capacity)
    }

    fn slow_factory(epochs: usize, millis: u64) -> ScriptedFactory {
        let mut factory = ScriptedFactory::new((0..epochs).map(|i| 100.0 - i as f64).collect());
        factory.on_epoch = Some(Arc::new(move |_| {
            std::thread::sleep(Duration::from_millis(millis))
        }));
        factory
    }

    fn submission(name: &str, epochs: u32, patience: u32, reiteration: u32) -> TrainingSubmission {
        TrainingSubmission {
            kind: JobKind::RaptGen,
            name: name.into(),
            params_training: training_params(epochs, patience)["params_training"].clone(),
            params_preprocessing: serde_json::json!({"forward": "AAA", "reverse": "TTT"}),
            random_regions: vec!["ACGU".into(), "GGCA".into(), "UUAG".into()],
            duplicates: vec![],
            reiteration,
        }
    }

    async fn wait_for_steps(orchestrator: &Orchestrator, parent_id: &str, steps: u32) {
        for _ in 0..500 {
            let children = orchestrator.store().list_children(parent_id).unwrap();
            if children.iter().all(|c| c.steps_completed >= steps) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("work-units of {} never reached {} steps", parent_id, steps);
    }

    #[tokio::test]
    async fn test_submit_runs_to_success() {
        let (orchestrator, _dir) = orchestrator(ScriptedFactory::new(vec![3.0, 2.0, 1.0]), 2);
        let parent_id = orchestrator.submit(submission("basic", 3, 5, 2)).unwrap();

        let parent = orchestrator.wait_for_parent(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Success);

        let detail = orchestrator.parent_detail(&parent_id).unwrap();
        assert_eq!(detail.summary.len(), 2);
        assert!(detail
            .summary
            .iter()
            .all(|c| c.status == JobStatus::Success && c.steps_completed == 3));
        assert_eq!(detail.job.params["params_preprocessing"]["forward"], "AAA");

        let child = orchestrator.child_detail(&parent_id, 1).unwrap();
        assert_eq!(child.losses.as_ref().unwrap().len(), 3);
        assert_eq!(child.latent.as_ref().unwrap().len(), 1);
        assert!(child.steps_completed.is_none());
        assert!(matches!(
            orchestrator.child_detail(&parent_id, 2),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let (orchestrator, _dir) = orchestrator(ScriptedFactory::new(vec![1.0]), 2);

        let mut blank = submission("  ", 1, 1, 1);
        assert!(matches!(orchestrator.submit(blank.clone()), Err(Error::InvalidInput(_))));

        blank.name = "ok".into();
        blank.reiteration = 0;
        assert!(matches!(orchestrator.submit(blank), Err(Error::InvalidInput(_))));

        let mut no_device = submission("gpu", 1, 1, 1);
        no_device.params_training["device"] = serde_json::json!("CUDA:99");
        assert!(matches!(orchestrator.submit(no_device), Err(Error::InvalidInput(_))));

        let mut mismatched = submission("dups", 1, 1, 1);
        mismatched.duplicates = vec![1];
        assert!(matches!(orchestrator.submit(mismatched), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let factory = slow_factory(30, 15);
        let (orchestrator, _dir) = orchestrator(factory, 2);
        let parent_id = orchestrator.submit(submission("long", 30, 100, 2)).unwrap();

        wait_for_steps(&orchestrator, &parent_id, 2).await;
        let parent = orchestrator.suspend(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Suspend);

        let children = orchestrator.store().list_children(&parent_id).unwrap();
        for child in &children {
            assert_eq!(child.status, JobStatus::Suspend);
            assert!(child.steps_completed < 30);
            let log = orchestrator.store().list_progress_log(&child.id).unwrap();
            assert_eq!(log.len() as u32, child.steps_completed);
        }

        // Only suspended jobs resume, only running jobs suspend
        assert!(matches!(
            orchestrator.suspend(&parent_id).await,
            Err(Error::InvalidState(_))
        ));

        let parent = orchestrator.resume(&parent_id).await.unwrap();
        assert_ne!(parent.status, JobStatus::Suspend);

        let parent = orchestrator.wait_for_parent(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Success);
        for child in orchestrator.store().list_children(&parent_id).unwrap() {
            assert_eq!(child.steps_completed, 30);
            assert_eq!(child.best_metric, Some(71.0));
        }
    }

    async fn resume_race(orchestrator: &Arc<Orchestrator>, parent_id: &str) -> Vec<Result<ParentJob>> {
        let barrier = Arc::new(Barrier::new(2));
        let racers: Vec<_> = (0..2)
            .map(|_| {
                let orchestrator = Arc::clone(orchestrator);
                let barrier = Arc::clone(&barrier);
                let parent_id = parent_id.to_string();
                tokio::spawn(async move {
                    barrier.wait().await;
                    orchestrator.resume(&parent_id).await
                })
            })
            .collect();
        let mut results = Vec::new();
        for racer in racers {
            results.push(racer.await.unwrap());
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resumes_dispatch_once() {
        let factory = slow_factory(40, 10);
        let calls = Arc::clone(&factory.calls);
        let (orchestrator, _dir) = orchestrator(factory, 2);
        let orchestrator = Arc::new(orchestrator);
        let parent_id = orchestrator.submit(submission("racing", 40, 100, 1)).unwrap();

        for round in 0..5u32 {
            wait_for_steps(&orchestrator, &parent_id, round + 1).await;
            let parent = orchestrator.suspend(&parent_id).await.unwrap();
            assert_eq!(parent.status, JobStatus::Suspend);

            let results = resume_race(&orchestrator, &parent_id).await;
            let won = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(won, 1, "round {}: {:?}", round, results);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(Error::InvalidState(_)))));
        }

        let parent = orchestrator.wait_for_parent(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Success);
        let child = &orchestrator.store().list_children(&parent_id).unwrap()[0];
        assert!(child.error_msg.is_none(), "{:?}", child.error_msg);
        // A doubly dispatched unit would train some epoch twice
        assert_eq!(*calls.lock(), (0..40).collect::<Vec<u32>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_suspend_and_resume() {
        let factory = slow_factory(40, 10);
        let calls = Arc::clone(&factory.calls);
        let (orchestrator, _dir) = orchestrator(factory, 2);
        let orchestrator = Arc::new(orchestrator);
        let parent_id = orchestrator.submit(submission("tug", 40, 100, 2)).unwrap();
        wait_for_steps_any(&orchestrator, &parent_id).await;

        for round in 0..4 {
            let status = orchestrator.store().get_parent(&parent_id).unwrap().unwrap().status;
            if status != JobStatus::Suspend {
                orchestrator.suspend(&parent_id).await.unwrap();
            }

            let barrier = Arc::new(Barrier::new(2));
            let suspender = {
                let orchestrator = Arc::clone(&orchestrator);
                let barrier = Arc::clone(&barrier);
                let parent_id = parent_id.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    orchestrator.suspend(&parent_id).await
                })
            };
            let resumer = {
                let orchestrator = Arc::clone(&orchestrator);
                let parent_id = parent_id.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    orchestrator.resume(&parent_id).await
                })
            };

            assert!(resumer.await.unwrap().is_ok(), "round {}", round);
            match suspender.await.unwrap() {
                Ok(parent) => assert_eq!(parent.status, JobStatus::Suspend),
                Err(Error::InvalidState(_)) => {}
                Err(e) => panic!("round {}: unexpected suspend error: {}", round, e),
            }
            for child in orchestrator.store().list_children(&parent_id).unwrap() {
                assert_ne!(child.status, JobStatus::Failure);
            }
        }

        let status = orchestrator.store().get_parent(&parent_id).unwrap().unwrap().status;
        if status == JobStatus::Suspend {
            orchestrator.resume(&parent_id).await.unwrap();
        }
        let parent = orchestrator.wait_for_parent(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Success);
        for child in orchestrator.store().list_children(&parent_id).unwrap() {
            assert!(child.error_msg.is_none(), "{:?}", child.error_msg);
            assert_eq!(child.steps_completed, 40);
        }
        let calls = calls.lock();
        for epoch in 0..40u32 {
            assert_eq!(calls.iter().filter(|e| **e == epoch).count(), 2, "epoch {}", epoch);
        }
    }

    #[tokio::test]
    async fn test_wrong_state_and_missing_jobs() {
        let (orchestrator, _dir) = orchestrator(ScriptedFactory::new(vec![1.0]), 2);
        let parent_id = orchestrator.submit(submission("short", 1, 1, 1)).unwrap();
        orchestrator.wait_for_parent(&parent_id).await.unwrap();

        assert!(matches!(
            orchestrator.suspend(&parent_id).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            orchestrator.resume(&parent_id).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            orchestrator.suspend("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.delete("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let (orchestrator, _dir) = orchestrator(slow_factory(3, 10), 1);
        let parent_id = orchestrator.submit(submission("gated", 3, 10, 3)).unwrap();

        let parent = orchestrator.wait_for_parent(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Success);
        assert_eq!(orchestrator.gate().pool("CPU").peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_suspend_queued_units_without_running() {
        let factory = slow_factory(20, 15);
        let calls = Arc::clone(&factory.calls);
        let (orchestrator, _dir) = orchestrator(factory, 1);
        let parent_id = orchestrator.submit(submission("queued", 20, 100, 3)).unwrap();

        wait_for_steps_any(&orchestrator, &parent_id).await;
        let parent = orchestrator.suspend(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Suspend);

        // Only one unit ever held the gate
        let children = orchestrator.store().list_children(&parent_id).unwrap();
        let started = children.iter().filter(|c| c.steps_completed > 0).count();
        assert_eq!(started, 1);
        assert!(calls.lock().len() < 20);
    }

    async fn wait_for_steps_any(orchestrator: &Orchestrator, parent_id: &str) {
        for _ in 0..500 {
            let children = orchestrator.store().list_children(parent_id).unwrap();
            if children.iter().any(|c| c.steps_completed > 0) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no work-unit of {} made progress", parent_id);
    }

    #[tokio::test]
    async fn test_delete_running_job() {
        let (orchestrator, _dir) = orchestrator(slow_factory(50, 10), 2);
        let parent_id = orchestrator.submit(submission("doomed", 50, 100, 2)).unwrap();
        wait_for_steps(&orchestrator, &parent_id, 1).await;
        let child_ids: Vec<String> = orchestrator
            .store()
            .list_children(&parent_id)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        orchestrator.delete(&parent_id).await.unwrap();
        assert!(orchestrator.store().get_parent(&parent_id).unwrap().is_none());
        for id in &child_ids {
            assert!(orchestrator.store().get_child(id).unwrap().is_none());
            assert!(orchestrator.store().list_progress_log(id).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_recover_stranded_units() {
        let (orchestrator, _dir) = orchestrator(ScriptedFactory::new(vec![2.0, 1.0]), 2);
        let store = Arc::clone(orchestrator.store());
        let parent_id = store
            .create_parent(&NewParentJob {
                name: "crashed".into(),
                kind: JobKind::RaptGen,
                reiteration: 2,
                steps_total: 2,
                params: training_params(2, 5),
                random_regions: vec!["ACGU".into()],
                duplicates: vec![],
            })
            .unwrap();
        let children = store.list_children(&parent_id).unwrap();
        orchestrator.hooks().on_start(&children[0].id).unwrap();

        assert_eq!(orchestrator.recover_stranded().unwrap(), 2);
        assert_eq!(
            store.get_parent(&parent_id).unwrap().unwrap().status,
            JobStatus::Suspend
        );

        orchestrator.resume(&parent_id).await.unwrap();
        let parent = orchestrator.wait_for_parent(&parent_id).await.unwrap();
        assert_eq!(parent.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn test_search_and_rename() {
        let (orchestrator, _dir) = orchestrator(ScriptedFactory::new(vec![1.0]), 2);
        let a = orchestrator.submit(submission("aptamer-alpha", 1, 1, 1)).unwrap();
        let b = orchestrator.submit(submission("aptamer-beta", 1, 1, 3)).unwrap();
        orchestrator.wait_for_parent(&a).await.unwrap();
        orchestrator.wait_for_parent(&b).await.unwrap();

        let found = orchestrator
            .search(&JobSearch {
                search_regex: Some("alpha$".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a);

        let multiple = orchestrator
            .search(&JobSearch {
                is_multiple: Some(true),
                statuses: Some(vec![JobStatus::Success]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(multiple.len(), 1);
        assert_eq!(multiple[0].id, b);

        assert!(matches!(
            orchestrator.search(&JobSearch {
                search_regex: Some("(".into()),
                ..Default::default()
            }),
            Err(Error::InvalidInput(_))
        ));

        assert_eq!(orchestrator.rename(&a, " gamma ").unwrap().name, "gamma");
        assert!(matches!(orchestrator.rename(&a, ""), Err(Error::InvalidInput(_))));
        assert!(matches!(orchestrator.rename("missing", "x"), Err(Error::NotFound(_))));
    }

    /// Sleeps a little per fit so a sweep can be caught mid-run.
    struct SlowFitter;

    impl MixtureFitter for SlowFitter {
        fn fit(&self, _points: &[LatentPoint], n_components: u32, trial: u32) -> Result<MixtureFit> {
            std::thread::sleep(Duration::from_millis(20));
            let k = n_components as usize;
            Ok(MixtureFit {
                params: MixtureParams {
                    weights: vec![1.0 / k as f64; k],
                    means: vec![vec![0.0, 0.0]; k],
                    covariances: vec![vec![vec![1.0, 0.0], vec![0.0, 1.0]]; k],
                },
                bic: 10.0 * n_components as f64 - trial as f64,
            })
        }
    }

    #[tokio::test]
    async fn test_sweep_lifecycle() {
        let (orchestrator, _dir) = orchestrator_with(
            ScriptedFactory::new(vec![2.0, 1.0]),
            Arc::new(SlowFitter),
            2,
        );
        let parent_id = orchestrator.submit(submission("trained", 2, 5, 1)).unwrap();
        orchestrator.wait_for_parent(&parent_id).await.unwrap();
        let target = orchestrator.store().list_children(&parent_id).unwrap()[0].id.clone();

        let sweep_id = orchestrator
            .submit_sweep(NewSweepJob {
                name: "bic".into(),
                target_child_id: target.clone(),
                min_components: 3,
                max_components: 5,
                step_size: 1,
                trials_per_component: 3,
            })
            .unwrap();

        for _ in 0..500 {
            let scores = orchestrator.store().list_bic_scores(&sweep_id).unwrap();
            if scores.len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sweep = orchestrator.suspend_sweep(&sweep_id).await.unwrap();
        assert_eq!(sweep.status, JobStatus::Suspend);

        let detail = orchestrator.sweep_detail(&sweep_id, None).unwrap();
        assert!(detail.current.is_some());
        let done = detail.bic_scores.as_ref().unwrap().len();
        assert!(done < 9);

        orchestrator.resume_sweep(&sweep_id).await.unwrap();
        let sweep = orchestrator.wait_for_sweep(&sweep_id).await.unwrap();
        assert_eq!(sweep.status, JobStatus::Success);

        for trial in orchestrator.store().list_trials(&sweep_id).unwrap() {
            assert_eq!(trial.trials_completed, 3);
        }
        let detail = orchestrator.sweep_detail(&sweep_id, None).unwrap();
        assert!(detail.current.is_none());
        assert_eq!(detail.bic_scores.unwrap().len(), 9);
        assert_eq!(detail.selected.unwrap().n_components, 3);
        let four = orchestrator.sweep_detail(&sweep_id, Some(4)).unwrap();
        assert_eq!(four.selected.unwrap().best_bic, Some(38.0));
        assert!(matches!(
            orchestrator.sweep_detail(&sweep_id, Some(9)),
            Err(Error::NotFound(_))
        ));

        let found = orchestrator
            .search_sweeps(&SweepSearch {
                statuses: Some(vec![JobStatus::Success]),
                search_regex: Some("^bi".into()),
            })
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(orchestrator.rename_sweep(&sweep_id, "renamed").unwrap().name, "renamed");

        orchestrator.delete_sweep(&sweep_id).await.unwrap();
        assert!(orchestrator.store().get_sweep(&sweep_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_requires_trained_target() {
        let (orchestrator, _dir) = orchestrator(ScriptedFactory::new(vec![1.0]), 2);
        let sweep = NewSweepJob {
            name: "bic".into(),
            target_child_id: "missing".into(),
            min_components: 1,
            max_components: 2,
            step_size: 1,
            trials_per_component: 1,
        };
        assert!(matches!(orchestrator.submit_sweep(sweep), Err(Error::NotFound(_))));
    }
}
