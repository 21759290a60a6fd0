//! Job runtime: concurrency gate, task queue, lifecycle hooks, resumable
//! training and sweep runners, and the orchestrator that ties them together.

pub mod em;
pub mod gate;
pub mod hooks;
pub mod orchestrator;
pub mod process_trainer;
pub mod queue;
pub mod sweep;
pub mod trainer;
pub mod training;
pub mod types;

pub use em::EmFitter;
pub use gate::{ConcurrencyGate, GatePermit, GatePool};
pub use hooks::{aggregate_parent_status, LifecycleHooks};
pub use orchestrator::Orchestrator;
pub use process_trainer::{ProcessTrainer, ProcessTrainerFactory};
pub use queue::TaskQueue;
pub use sweep::{MixtureFit, MixtureFitter, SweepRunner};
pub use trainer::{EpochSchedule, Trainer, TrainerFactory, TrainingParams, TrainingUnit};
pub use training::{ProgressState, TrainingRunner, UnitOutcome};
pub use types::*;
