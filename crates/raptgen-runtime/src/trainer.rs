//! Training seam: the opaque per-epoch compute the training runner drives.

use raptgen_core::{ComputeDevice, Error, Result};
use raptgen_store::{JobKind, LatentPoint, SequenceRecord, StepMetrics};
use serde::{Deserialize, Serialize};

/// Training knobs of a parent job (`params_training` of a submission).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub model_length: u32,
    /// Step budget of every work-unit.
    pub epochs: u32,
    /// Epochs during which the auxiliary matching term is force-applied.
    pub match_forcing_duration: u32,
    /// Warm-up epochs of the KL weight.
    pub beta_duration: u32,
    /// Patience: epochs without improvement before stopping early.
    pub early_stopping: u32,
    pub seed_value: u64,
    pub match_cost: f64,
    pub device: ComputeDevice,
    /// Model-specific extras, passed through to the trainer untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TrainingParams {
    /// Read `params_training` out of a parent job's parameter blob.
    pub fn from_job_params(params: &serde_json::Value) -> Result<Self> {
        let training = params
            .get("params_training")
            .ok_or_else(|| Error::InvalidInput("missing params_training".into()))?;
        let parsed: Self = serde_json::from_value(training.clone())
            .map_err(|e| Error::InvalidInput(format!("invalid params_training: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidInput("epochs must be >= 1".into()));
        }
        if self.early_stopping == 0 {
            return Err(Error::InvalidInput("early_stopping must be >= 1".into()));
        }
        if self.model_length == 0 {
            return Err(Error::InvalidInput("model_length must be >= 1".into()));
        }
        if !self.match_cost.is_finite() || self.match_cost < 0.0 {
            return Err(Error::InvalidInput("match_cost must be a non-negative number".into()));
        }
        Ok(())
    }
}

/// Per-epoch schedule handed to the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSchedule {
    pub epoch: u32,
    /// KL weight, ramped linearly from 0 to 1 over `beta_duration`.
    pub beta: f64,
    pub force_matching: bool,
    /// Weight of the matching term, decaying towards 1 while forced.
    pub match_cost: f64,
}

impl EpochSchedule {
    pub fn for_epoch(epoch: u32, params: &TrainingParams) -> Self {
        let beta = if epoch < params.beta_duration {
            epoch as f64 / params.beta_duration as f64
        } else {
            1.0
        };
        let force_matching = epoch < params.match_forcing_duration;
        let match_cost = if force_matching {
            1.0 + params.match_cost * (1.0 - epoch as f64 / params.match_forcing_duration as f64)
        } else {
            1.0
        };
        Self {
            epoch,
            beta,
            force_matching,
            match_cost,
        }
    }
}

/// Everything a trainer needs to build its model for one work-unit.
#[derive(Debug, Clone, Copy)]
pub struct TrainingUnit<'a> {
    pub kind: JobKind,
    pub child_index: u32,
    pub params: &'a TrainingParams,
    pub sequences: &'a [SequenceRecord],
}

/// Stateful per-unit trainer. Calls are made from a blocking context.
pub trait Trainer: Send {
    /// Run one epoch and report its metrics.
    fn train_epoch(&mut self, schedule: &EpochSchedule) -> Result<StepMetrics>;

    /// Serialize model and optimizer state.
    fn save_checkpoint(&mut self) -> Result<Vec<u8>>;

    /// Restore state produced by [`save_checkpoint`](Self::save_checkpoint).
    fn load_checkpoint(&mut self, bytes: &[u8]) -> Result<()>;

    /// Latent coordinates of every sequence under the current state.
    fn embed(&mut self) -> Result<Vec<LatentPoint>>;
}

pub trait TrainerFactory: Send + Sync {
    fn create(&self, unit: &TrainingUnit<'_>) -> Result<Box<dyn Trainer>>;
}
