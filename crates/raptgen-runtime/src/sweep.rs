//! BIC-sweep runner.
//!
//! Visits component counts in ascending order and, for each one that still
//! has trials left, runs the remaining fits. Every fit is committed on its
//! own (score row, best parameters if strictly lower, trial counter), so a
//! resumed sweep simply re-enters at the first unexhausted component count.

use std::sync::Arc;

use raptgen_core::{Error, Result};
use raptgen_store::{LatentPoint, MixtureParams, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hooks::LifecycleHooks;
use crate::training::UnitOutcome;

/// One fitted mixture and its score.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureFit {
    pub params: MixtureParams,
    /// Bayesian information criterion; lower is better.
    pub bic: f64,
}

/// Fits a Gaussian mixture to latent coordinates. Fits are allowed to be
/// non-deterministic; `trial` distinguishes repeated fits of the same size.
pub trait MixtureFitter: Send + Sync {
    fn fit(&self, points: &[LatentPoint], n_components: u32, trial: u32) -> Result<MixtureFit>;
}

pub struct SweepRunner {
    store: Arc<SqliteStore>,
    hooks: Arc<LifecycleHooks>,
    fitter: Arc<dyn MixtureFitter>,
}

impl SweepRunner {
    pub fn new(
        store: Arc<SqliteStore>,
        hooks: Arc<LifecycleHooks>,
        fitter: Arc<dyn MixtureFitter>,
    ) -> Self {
        Self {
            store,
            hooks,
            fitter,
        }
    }

    /// Run a sweep until every component count is exhausted, the token is
    /// cancelled or a fit fails. Blocks.
    pub fn run(&self, sweep_id: &str, cancel: &CancellationToken) -> Result<UnitOutcome> {
        self.hooks.on_sweep_start(sweep_id)?;
        match self.sweep(sweep_id, cancel) {
            Ok(UnitOutcome::Completed) => {
                self.hooks.on_sweep_success(sweep_id)?;
                Ok(UnitOutcome::Completed)
            }
            Ok(UnitOutcome::Suspended) => {
                self.hooks.on_sweep_suspend(sweep_id)?;
                Ok(UnitOutcome::Suspended)
            }
            Err(e) => {
                self.hooks.on_sweep_failure(sweep_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    fn sweep(&self, sweep_id: &str, cancel: &CancellationToken) -> Result<UnitOutcome> {
        let sweep = self
            .store
            .get_sweep(sweep_id)?
            .ok_or_else(|| Error::NotFound(format!("sweep {}", sweep_id)))?;
        let points = self.store.list_embeddings(&sweep.target_child_id)?;
        if points.is_empty() {
            return Err(Error::InvalidState(format!(
                "work-unit {} has no latent coordinates to fit",
                sweep.target_child_id
            )));
        }

        for trial in self.store.list_trials(sweep_id)? {
            if trial.is_exhausted() {
                continue;
            }
            self.store
                .set_sweep_current_components(sweep_id, trial.n_components)?;
            info!(
                "Sweep {}: fitting {} components, trial {} of {}",
                sweep_id,
                trial.n_components,
                trial.trials_completed + 1,
                trial.trials_total
            );

            for index in trial.trials_completed..trial.trials_total {
                if cancel.is_cancelled() {
                    return Ok(UnitOutcome::Suspended);
                }
                let fit = self.fitter.fit(&points, trial.n_components, index)?;
                if !fit.bic.is_finite() {
                    return Err(Error::Compute(format!(
                        "BIC is {} for {} components",
                        fit.bic, trial.n_components
                    )));
                }
                let updated =
                    self.store
                        .commit_sweep_trial(sweep_id, trial.n_components, fit.bic, &fit.params)?;
                debug!(
                    "Sweep {}: {} components trial {} bic={:.3} best={:?}",
                    sweep_id, trial.n_components, index, fit.bic, updated.best_bic
                );
            }
        }

        Ok(UnitOutcome::Completed)
    }
}
