//! Runtime request and view types.

use raptgen_store::{
    BicScore, ChildJob, JobKind, JobStatus, LatentPoint, ParentJob, ProgressLogEntry, SweepJob,
    SweepTrial,
};
use serde::{Deserialize, Serialize};

/// A training submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSubmission {
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub name: String,
    pub params_training: serde_json::Value,
    #[serde(default)]
    pub params_preprocessing: serde_json::Value,
    pub random_regions: Vec<String>,
    #[serde(default)]
    pub duplicates: Vec<u32>,
    /// Number of independent work-units to train.
    pub reiteration: u32,
}

/// Filter for searching parent jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSearch {
    #[serde(default, rename = "status")]
    pub statuses: Option<Vec<JobStatus>>,
    #[serde(default)]
    pub search_regex: Option<String>,
    /// `true`: more than one work-unit, `false`: exactly one.
    #[serde(default)]
    pub is_multiple: Option<bool>,
    #[serde(default, rename = "type")]
    pub kinds: Option<Vec<JobKind>>,
}

/// Filter for searching sweeps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepSearch {
    #[serde(default, rename = "status")]
    pub statuses: Option<Vec<JobStatus>>,
    #[serde(default)]
    pub search_regex: Option<String>,
}

/// Row of a parent's per-unit summary.
#[derive(Debug, Clone, Serialize)]
pub struct ChildSummary {
    pub index: u32,
    pub status: JobStatus,
    pub steps_completed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<f64>,
}

impl From<&ChildJob> for ChildSummary {
    fn from(child: &ChildJob) -> Self {
        Self {
            index: child.index,
            status: child.status,
            steps_completed: child.steps_completed,
            best_metric: child.best_metric,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParentDetail {
    #[serde(flatten)]
    pub job: ParentJob,
    pub duration_secs: i64,
    pub summary: Vec<ChildSummary>,
}

/// Work-unit view. Series and coordinates are present only once the unit
/// has started and has not failed.
#[derive(Debug, Clone, Serialize)]
pub struct ChildDetail {
    pub uuid: String,
    pub index: u32,
    pub status: JobStatus,
    pub steps_total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_completed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latent: Option<Vec<LatentPoint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub losses: Option<Vec<ProgressLogEntry>>,
}

/// Position of a sweep that has not finished.
#[derive(Debug, Clone, Serialize)]
pub struct SweepCursor {
    pub n_components: u32,
    pub trials_completed: u32,
    pub trials_total: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepDetail {
    #[serde(flatten)]
    pub job: SweepJob,
    pub duration_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<SweepCursor>,
    /// The requested component count, or the lowest-BIC one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<SweepTrial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bic_scores: Option<Vec<BicScore>>,
}
