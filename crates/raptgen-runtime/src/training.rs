//! Resumable training runner.
//!
//! A work-unit trains for at most `steps_total` epochs. Each completed epoch
//! is committed in one transaction (progress row, step counter, `current`
//! checkpoint and, on strict improvement, best metric, `optimal` checkpoint
//! and latent embeddings). Cancellation is only observed between epochs.
//!
//! On resume the best metric and the patience counter are rebuilt from the
//! unit's progress log, never carried over in memory.

use std::sync::Arc;

use raptgen_core::{Error, Result};
use raptgen_store::{CheckpointSlot, Improvement, SqliteStore, StepCommit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hooks::LifecycleHooks;
use crate::trainer::{EpochSchedule, TrainerFactory, TrainingParams, TrainingUnit};

/// How a runner invocation ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Budget exhausted or stopped early.
    Completed,
    /// Cancellation observed at a step boundary.
    Suspended,
}

/// Best metric and patience counter as recorded in the progress log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressState {
    /// Next epoch to run; equals the number of committed epochs.
    pub next_epoch: u32,
    pub best_metric: Option<f64>,
    pub since_improvement: u32,
}

impl ProgressState {
    /// Rebuild from the durable log of `child_id`.
    pub fn recover(store: &SqliteStore, child_id: &str, steps_completed: u32) -> Result<Self> {
        let best = store.best_progress_entry(child_id)?;
        let since_improvement = match &best {
            Some(entry) if steps_completed > 0 => (steps_completed - 1).saturating_sub(entry.epoch),
            _ => 0,
        };
        Ok(Self {
            next_epoch: steps_completed,
            best_metric: best.map(|e| e.metrics.test_loss),
            since_improvement,
        })
    }
}

pub struct TrainingRunner {
    store: Arc<SqliteStore>,
    hooks: Arc<LifecycleHooks>,
    factory: Arc<dyn TrainerFactory>,
}

impl TrainingRunner {
    pub fn new(
        store: Arc<SqliteStore>,
        hooks: Arc<LifecycleHooks>,
        factory: Arc<dyn TrainerFactory>,
    ) -> Self {
        Self {
            store,
            hooks,
            factory,
        }
    }

    /// Run a unit to completion, suspension or failure and persist the
    /// outcome through the lifecycle hooks. Blocks; call it from a blocking
    /// context while holding the unit's gate permit.
    pub fn run(&self, child_id: &str, resume: bool, cancel: &CancellationToken) -> Result<UnitOutcome> {
        self.hooks.on_start(child_id)?;
        match self.train(child_id, resume, cancel) {
            Ok(UnitOutcome::Completed) => {
                self.hooks.on_success(child_id)?;
                Ok(UnitOutcome::Completed)
            }
            Ok(UnitOutcome::Suspended) => {
                self.hooks.on_suspend(child_id)?;
                Ok(UnitOutcome::Suspended)
            }
            Err(e) => {
                self.hooks.on_failure(child_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    fn train(&self, child_id: &str, resume: bool, cancel: &CancellationToken) -> Result<UnitOutcome> {
        let child = self
            .store
            .get_child(child_id)?
            .ok_or_else(|| Error::NotFound(format!("work-unit {}", child_id)))?;
        let parent = self
            .store
            .get_parent(&child.parent_id)?
            .ok_or_else(|| Error::NotFound(format!("parent job {}", child.parent_id)))?;
        let params = TrainingParams::from_job_params(&parent.params)?;
        let sequences = self.store.list_sequences(&parent.id)?;

        if !resume && child.steps_completed > 0 {
            return Err(Error::InvalidState(format!(
                "work-unit {} already completed {} epochs; it can only be resumed",
                child_id, child.steps_completed
            )));
        }

        let mut trainer = self.factory.create(&TrainingUnit {
            kind: parent.kind,
            child_index: child.index,
            params: &params,
            sequences: &sequences,
        })?;

        let mut state = if resume {
            if child.steps_completed > 0 {
                let checkpoint = self
                    .store
                    .read_checkpoint(child_id, CheckpointSlot::Current)?
                    .ok_or_else(|| {
                        Error::InvalidState(format!(
                            "work-unit {} has {} epochs but no checkpoint",
                            child_id, child.steps_completed
                        ))
                    })?;
                trainer.load_checkpoint(&checkpoint)?;
            }
            ProgressState::recover(&self.store, child_id, child.steps_completed)?
        } else {
            ProgressState {
                next_epoch: 0,
                best_metric: None,
                since_improvement: 0,
            }
        };

        info!(
            "Training work-unit {} from epoch {} of {} (patience {})",
            child_id, state.next_epoch, child.steps_total, params.early_stopping
        );

        while state.next_epoch < child.steps_total {
            if state.since_improvement >= params.early_stopping {
                info!(
                    "Work-unit {} stopped early after epoch {}",
                    child_id,
                    state.next_epoch.saturating_sub(1)
                );
                break;
            }
            if cancel.is_cancelled() {
                return Ok(UnitOutcome::Suspended);
            }

            let epoch = state.next_epoch;
            let schedule = EpochSchedule::for_epoch(epoch, &params);
            let metrics = trainer.train_epoch(&schedule)?;
            if !metrics.train_loss.is_finite() {
                return Err(Error::Compute(format!(
                    "training loss is {} at epoch {}",
                    metrics.train_loss, epoch
                )));
            }
            if !metrics.test_loss.is_finite() {
                return Err(Error::Compute(format!(
                    "validation loss is {} at epoch {}",
                    metrics.test_loss, epoch
                )));
            }
            let checkpoint = trainer.save_checkpoint()?;

            let improved = state.best_metric.map_or(true, |best| metrics.test_loss < best);
            let embeddings = if improved { trainer.embed()? } else { Vec::new() };

            self.store.commit_training_step(
                child_id,
                &StepCommit {
                    epoch,
                    metrics,
                    current_checkpoint: &checkpoint,
                    improvement: improved.then(|| Improvement {
                        best_metric: metrics.test_loss,
                        embeddings: &embeddings,
                    }),
                },
            )?;

            if improved {
                state.best_metric = Some(metrics.test_loss);
                state.since_improvement = 0;
            } else {
                state.since_improvement += 1;
            }
            state.next_epoch += 1;
            debug!(
                "Work-unit {} epoch {}: train={:.4} test={:.4} improved={}",
                child_id, epoch, metrics.train_loss, metrics.test_loss, improved
            );
        }

        Ok(UnitOutcome::Completed)
    }
}
