//! Row types for jobs, work-units, progress logs and sweeps.

use serde::{Deserialize, Serialize};

use raptgen_core::{Error, Result};

/// Lifecycle status shared by parent jobs, work-units and sweeps.
///
/// `pending -> progress -> {success | failure | suspend}`, `suspend -> progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Progress,
    Suspend,
    Success,
    Failure,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Progress,
        Self::Suspend,
        Self::Success,
        Self::Failure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Progress => "progress",
            Self::Suspend => "suspend",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    /// Queued or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Progress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "progress" => Ok(Self::Progress),
            "suspend" => Ok(Self::Suspend),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(Error::InvalidInput(format!("unknown status: {}", other))),
        }
    }
}

/// Model family trained by a parent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "RaptGen")]
    RaptGen,
    #[serde(rename = "RaptGen-freq")]
    RaptGenFreq,
    #[serde(rename = "RaptGen-logfreq")]
    RaptGenLogFreq,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RaptGen => "RaptGen",
            Self::RaptGenFreq => "RaptGen-freq",
            Self::RaptGenLogFreq => "RaptGen-logfreq",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RaptGen" => Ok(Self::RaptGen),
            "RaptGen-freq" => Ok(Self::RaptGenFreq),
            "RaptGen-logfreq" => Ok(Self::RaptGenLogFreq),
            other => Err(Error::InvalidInput(format!(
                "model type must be one of: 'RaptGen', 'RaptGen-freq' or 'RaptGen-logfreq', got {:?}",
                other
            ))),
        }
    }
}

/// Elapsed running time, excluding time spent suspended.
fn elapsed_secs(
    status: JobStatus,
    started_at: Option<i64>,
    stopped_at: Option<i64>,
    suspended_secs: i64,
    now: i64,
) -> i64 {
    let Some(start) = started_at else {
        return 0;
    };
    let end = match status {
        JobStatus::Pending => return 0,
        JobStatus::Progress => now,
        _ => stopped_at.unwrap_or(now),
    };
    (end - start - suspended_secs).max(0)
}

/// A user-submitted request that fans out into work-units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentJob {
    pub id: String,
    pub name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<i64>,
    pub suspended_secs: i64,
    /// Number of work-units requested.
    pub reiteration: u32,
    pub params: serde_json::Value,
}

impl ParentJob {
    pub fn duration_secs(&self, now: i64) -> i64 {
        elapsed_secs(
            self.status,
            self.started_at,
            self.stopped_at,
            self.suspended_secs,
            now,
        )
    }
}

/// The smallest independently resumable piece of training work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildJob {
    pub id: String,
    pub parent_id: String,
    /// Zero-based position among its siblings.
    pub index: u32,
    /// Identity of the task currently executing this unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    pub steps_total: u32,
    pub steps_completed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

/// Metrics produced by one training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub train_loss: f64,
    /// Validation loss; the tracked metric.
    pub test_loss: f64,
    pub test_recon: f64,
    pub test_kld: f64,
}

/// One row of a work-unit's append-only progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLogEntry {
    pub epoch: u32,
    #[serde(flatten)]
    pub metrics: StepMetrics,
}

/// Checkpoint slot of a work-unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSlot {
    /// State after the most recent completed step; used to resume.
    Current,
    /// State at the best-metric step; used for publishing.
    Optimal,
}

impl CheckpointSlot {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Current => "current_checkpoint",
            Self::Optimal => "optimal_checkpoint",
        }
    }
}

/// A training sequence attached to a parent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub seq_id: u32,
    pub random_region: String,
    pub duplicate: u32,
    pub is_training: bool,
}

/// Latent coordinates of one sequence under a unit's best state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatentPoint {
    pub seq_id: u32,
    pub coord_x: f64,
    pub coord_y: f64,
}

/// Everything persisted for one completed training step, committed atomically.
#[derive(Debug, Clone)]
pub struct StepCommit<'a> {
    pub epoch: u32,
    pub metrics: StepMetrics,
    pub current_checkpoint: &'a [u8],
    /// Present only when the step strictly improved the best metric.
    pub improvement: Option<Improvement<'a>>,
}

/// Best-state update carried by an improving step. The optimal checkpoint
/// becomes a copy of the step's current checkpoint.
#[derive(Debug, Clone)]
pub struct Improvement<'a> {
    pub best_metric: f64,
    pub embeddings: &'a [LatentPoint],
}

/// Submission of a new parent job.
#[derive(Debug, Clone)]
pub struct NewParentJob {
    pub name: String,
    pub kind: JobKind,
    pub reiteration: u32,
    /// Step budget of each work-unit.
    pub steps_total: u32,
    pub params: serde_json::Value,
    pub random_regions: Vec<String>,
    /// Read counts per sequence; empty means one read each.
    pub duplicates: Vec<u32>,
}

/// Fraction of submitted sequences flagged as training data.
pub const TRAINING_SPLIT: f64 = 0.8;

/// Filter for listing parent jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Option<Vec<JobStatus>>,
    pub kinds: Option<Vec<JobKind>>,
    /// `Some(true)`: more than one work-unit; `Some(false)`: exactly one.
    pub multiple: Option<bool>,
}

/// Fitted Gaussian-mixture parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureParams {
    pub weights: Vec<f64>,
    pub means: Vec<Vec<f64>>,
    pub covariances: Vec<Vec<Vec<f64>>>,
}

/// A job fitting a family of mixtures and scoring each by BIC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepJob {
    pub id: String,
    pub name: String,
    /// Work-unit whose latent coordinates are fitted.
    pub target_child_id: String,
    pub status: JobStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<i64>,
    pub suspended_secs: i64,
    pub min_components: u32,
    pub max_components: u32,
    pub step_size: u32,
    pub trials_per_component: u32,
    /// Component count currently being fitted.
    pub current_components: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl SweepJob {
    pub fn duration_secs(&self, now: i64) -> i64 {
        elapsed_secs(
            self.status,
            self.started_at,
            self.stopped_at,
            self.suspended_secs,
            now,
        )
    }
}

/// Largest mixture a sweep may fit.
pub const MAX_SWEEP_COMPONENTS: u32 = 100;
/// Upper bound on random restarts per component count.
pub const MAX_TRIALS_PER_COMPONENT: u32 = 100;

/// Submission of a new sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSweepJob {
    pub name: String,
    pub target_child_id: String,
    pub min_components: u32,
    pub max_components: u32,
    pub step_size: u32,
    pub trials_per_component: u32,
}

impl NewSweepJob {
    pub fn validate(&self) -> Result<()> {
        if self.min_components == 0 {
            return Err(Error::InvalidInput("minimum_n_components must be >= 1".into()));
        }
        if self.max_components < self.min_components {
            return Err(Error::InvalidInput(
                "maximum_n_components must be >= minimum_n_components".into(),
            ));
        }
        if self.max_components > MAX_SWEEP_COMPONENTS {
            return Err(Error::InvalidInput(format!(
                "maximum_n_components must be <= {}",
                MAX_SWEEP_COMPONENTS
            )));
        }
        if self.step_size == 0 {
            return Err(Error::InvalidInput("step_size must be >= 1".into()));
        }
        if self.trials_per_component == 0 {
            return Err(Error::InvalidInput("n_trials_per_component must be >= 1".into()));
        }
        if self.trials_per_component > MAX_TRIALS_PER_COMPONENT {
            return Err(Error::InvalidInput(format!(
                "n_trials_per_component must be <= {}",
                MAX_TRIALS_PER_COMPONENT
            )));
        }
        Ok(())
    }

    /// Component counts `min, min+step, ...` up to and including `max`.
    pub fn component_counts(&self) -> Vec<u32> {
        (self.min_components..=self.max_components)
            .step_by(self.step_size.max(1) as usize)
            .collect()
    }
}

/// Best-so-far state of one component count within a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepTrial {
    pub n_components: u32,
    pub trials_completed: u32,
    pub trials_total: u32,
    /// Lowest BIC seen; `None` until the first trial completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_bic: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<MixtureParams>,
}

impl SweepTrial {
    pub fn is_exhausted(&self) -> bool {
        self.trials_completed >= self.trials_total
    }
}

/// One row of a sweep's append-only score log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BicScore {
    pub n_components: u32,
    pub bic: f64,
}
