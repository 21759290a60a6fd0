//! Trainer backed by an external worker process.
//!
//! The worker speaks one JSON object per line. Requests carry a `cmd` tag
//! (`init`, `epoch`, `save`, `load`, `embed`, `shutdown`), replies a `type`
//! tag. Checkpoints cross the pipe base64-encoded. Log replies may arrive
//! at any time and are forwarded to tracing.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use raptgen_core::{Error, Result, TrainerConfig};
use raptgen_store::{JobKind, LatentPoint, SequenceRecord, StepMetrics};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::trainer::{EpochSchedule, Trainer, TrainerFactory, TrainingParams, TrainingUnit};

/// How long a worker may take to exit after `shutdown` before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum WorkerRequest<'a> {
    Init {
        kind: JobKind,
        child_index: u32,
        params: &'a TrainingParams,
        sequences: &'a [SequenceRecord],
    },
    Epoch(&'a EpochSchedule),
    Save,
    Load {
        checkpoint: String,
    },
    Embed,
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerReply {
    Ready,
    Metrics(StepMetrics),
    Checkpoint { data: String },
    Loaded,
    Embedding { points: Vec<LatentPoint> },
    Error { message: String },
    Log { level: String, message: String },
}

pub struct ProcessTrainer {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ProcessTrainer {
    /// Launch the worker and send `init`.
    pub fn spawn(config: &TrainerConfig, unit: &TrainingUnit<'_>) -> Result<Self> {
        if !config.script.exists() {
            return Err(Error::Config(format!(
                "trainer script not found: {}",
                config.script.display()
            )));
        }

        let mut child = Command::new(&config.python)
            .arg(&config.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Compute(format!("failed to spawn trainer: {}", e)))?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("trainer stdout not captured".into()))?;

        info!(
            "Spawned trainer pid={} for {} unit {}",
            child.id(),
            unit.kind,
            unit.child_index
        );

        let mut trainer = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        match trainer.call(&WorkerRequest::Init {
            kind: unit.kind,
            child_index: unit.child_index,
            params: unit.params,
            sequences: unit.sequences,
        })? {
            WorkerReply::Ready => Ok(trainer),
            other => Err(unexpected("init", &other)),
        }
    }

    fn call(&mut self, request: &WorkerRequest<'_>) -> Result<WorkerReply> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Internal("trainer stdin closed".into()))?;
        let line = serde_json::to_string(request)?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;

        let mut buf = String::new();
        loop {
            buf.clear();
            if self.stdout.read_line(&mut buf)? == 0 {
                return Err(Error::Compute("trainer process exited unexpectedly".into()));
            }
            let text = buf.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkerReply>(text) {
                Ok(WorkerReply::Log { level, message }) => match level.as_str() {
                    "error" | "warning" | "warn" => warn!("[trainer] {}", message),
                    "info" => info!("[trainer] {}", message),
                    _ => debug!("[trainer] {}", message),
                },
                Ok(WorkerReply::Error { message }) => return Err(Error::Compute(message)),
                Ok(reply) => return Ok(reply),
                Err(_) => debug!("[trainer] {}", text),
            }
        }
    }
}

fn unexpected(command: &str, reply: &WorkerReply) -> Error {
    Error::Compute(format!("unexpected trainer reply to {}: {:?}", command, reply))
}

impl Trainer for ProcessTrainer {
    fn train_epoch(&mut self, schedule: &EpochSchedule) -> Result<StepMetrics> {
        match self.call(&WorkerRequest::Epoch(schedule))? {
            WorkerReply::Metrics(metrics) => Ok(metrics),
            other => Err(unexpected("epoch", &other)),
        }
    }

    fn save_checkpoint(&mut self) -> Result<Vec<u8>> {
        match self.call(&WorkerRequest::Save)? {
            WorkerReply::Checkpoint { data } => STANDARD
                .decode(data.as_bytes())
                .map_err(|e| Error::Compute(format!("invalid checkpoint encoding: {}", e))),
            other => Err(unexpected("save", &other)),
        }
    }

    fn load_checkpoint(&mut self, bytes: &[u8]) -> Result<()> {
        let request = WorkerRequest::Load {
            checkpoint: STANDARD.encode(bytes),
        };
        match self.call(&request)? {
            WorkerReply::Loaded => Ok(()),
            other => Err(unexpected("load", &other)),
        }
    }

    fn embed(&mut self) -> Result<Vec<LatentPoint>> {
        match self.call(&WorkerRequest::Embed)? {
            WorkerReply::Embedding { points } => Ok(points),
            other => Err(unexpected("embed", &other)),
        }
    }
}

impl Drop for ProcessTrainer {
    fn drop(&mut self) {
        // Closing stdin after `shutdown` also ends a worker that ignores it
        if let Some(mut stdin) = self.stdin.take() {
            if let Ok(line) = serde_json::to_string(&WorkerRequest::Shutdown) {
                let _ = writeln!(stdin, "{}", line);
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Trainer worker exited with {}", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(SHUTDOWN_POLL),
                Ok(None) => {
                    warn!(
                        "Trainer worker still running {}s after shutdown; killing it",
                        SHUTDOWN_GRACE.as_secs()
                    );
                    break;
                }
                Err(e) => {
                    warn!("Failed to poll trainer worker: {}", e);
                    break;
                }
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawns one [`ProcessTrainer`] per work-unit run.
pub struct ProcessTrainerFactory {
    config: TrainerConfig,
}

impl ProcessTrainerFactory {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }
}

impl TrainerFactory for ProcessTrainerFactory {
    fn create(&self, unit: &TrainingUnit<'_>) -> Result<Box<dyn Trainer>> {
        Ok(Box::new(ProcessTrainer::spawn(&self.config, unit)?))
    }
}
