//! Configuration and data directory management.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Default admission capacity per resource class.
pub const DEFAULT_GATE_CAPACITY: usize = 2;

/// Default caller-side deadline for suspend/resume waits.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 600;

/// Paths to all RaptGen data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Job database directory (`data/db/`).
    pub db: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            root,
        };
        std::fs::create_dir_all(&paths.db)?;
        Ok(paths)
    }
}

/// Capacities of the concurrency gates, one gate per resource class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Capacity for any class without an override.
    pub default_capacity: usize,
    /// Per-class capacities keyed by class name (`CPU`, `CUDA:0`, ...).
    pub overrides: HashMap<String, usize>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_GATE_CAPACITY,
            overrides: HashMap::new(),
        }
    }
}

impl GateConfig {
    pub fn capacity_for(&self, class: &str) -> usize {
        self.overrides
            .get(class)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    /// Parse overrides of the form `CPU=4,CUDA:0=1`.
    pub fn parse_overrides(spec: &str) -> Result<HashMap<String, usize>> {
        let mut overrides = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (class, capacity) = entry
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("expected CLASS=N, got {:?}", entry)))?;
            let capacity: usize = capacity
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid capacity in {:?}", entry)))?;
            if capacity == 0 {
                return Err(Error::Config(format!("capacity must be > 0 in {:?}", entry)));
            }
            overrides.insert(class.trim().to_ascii_uppercase(), capacity);
        }
        Ok(overrides)
    }
}

/// External trainer process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Interpreter used to launch the trainer script.
    pub python: String,
    /// Trainer worker script speaking the JSON-lines protocol.
    pub script: PathBuf,
}

/// Top-level RaptGen configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaptgenConfig {
    /// HTTP server port.
    pub port: u16,
    /// Data directory paths.
    pub data_paths: DataPaths,
    pub gates: GateConfig,
    /// Deadline for blocking suspend/resume waits.
    pub wait_timeout: Duration,
    pub trainer: TrainerConfig,
}

impl RaptgenConfig {
    /// Create configuration from environment and defaults.
    pub fn from_env(data_dir: impl AsRef<Path>) -> Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let data_paths = DataPaths::new(data_dir)?;

        let default_capacity = match std::env::var("RAPTGEN_GATE_CAPACITY") {
            Ok(v) => v
                .parse()
                .ok()
                .filter(|c: &usize| *c > 0)
                .ok_or_else(|| Error::Config(format!("invalid RAPTGEN_GATE_CAPACITY: {}", v)))?,
            Err(_) => DEFAULT_GATE_CAPACITY,
        };
        let overrides = match std::env::var("RAPTGEN_GATE_CAPACITIES") {
            Ok(v) => GateConfig::parse_overrides(&v)?,
            Err(_) => HashMap::new(),
        };

        let wait_timeout = std::env::var("RAPTGEN_WAIT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS);

        let trainer = TrainerConfig {
            python: std::env::var("RAPTGEN_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            script: std::env::var("RAPTGEN_TRAINER_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_paths.root.join("workers").join("train_vae.py")),
        };

        Ok(Self {
            port,
            data_paths,
            gates: GateConfig {
                default_capacity,
                overrides,
            },
            wait_timeout: Duration::from_secs(wait_timeout),
            trainer,
        })
    }
}
