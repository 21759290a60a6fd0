//! Database schema SQL.

/// Training jobs: parents, work-units, progress logs, sequences, embeddings.
pub const JOBS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS parent_jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    stopped_at INTEGER,
    suspended_secs INTEGER NOT NULL DEFAULT 0,
    reiteration INTEGER NOT NULL,
    params_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS child_jobs (
    id TEXT PRIMARY KEY,
    parent_id TEXT NOT NULL REFERENCES parent_jobs(id) ON DELETE CASCADE,
    child_index INTEGER NOT NULL,
    worker_id TEXT,
    status TEXT NOT NULL,
    started_at INTEGER,
    steps_total INTEGER NOT NULL,
    steps_completed INTEGER NOT NULL DEFAULT 0,
    best_metric REAL,
    error_msg TEXT,
    current_checkpoint BLOB,
    optimal_checkpoint BLOB,
    UNIQUE (parent_id, child_index)
);

CREATE INDEX IF NOT EXISTS idx_child_jobs_parent ON child_jobs(parent_id);
CREATE INDEX IF NOT EXISTS idx_child_jobs_status ON child_jobs(status);

CREATE TABLE IF NOT EXISTS training_losses (
    child_id TEXT NOT NULL REFERENCES child_jobs(id) ON DELETE CASCADE,
    epoch INTEGER NOT NULL,
    train_loss REAL NOT NULL,
    test_loss REAL NOT NULL,
    test_recon REAL NOT NULL,
    test_kld REAL NOT NULL,
    PRIMARY KEY (child_id, epoch)
);

CREATE TABLE IF NOT EXISTS sequence_data (
    parent_id TEXT NOT NULL REFERENCES parent_jobs(id) ON DELETE CASCADE,
    seq_id INTEGER NOT NULL,
    random_region TEXT NOT NULL,
    duplicate INTEGER NOT NULL DEFAULT 1,
    is_training INTEGER NOT NULL,
    PRIMARY KEY (parent_id, seq_id)
);

CREATE TABLE IF NOT EXISTS sequence_embeddings (
    child_id TEXT NOT NULL REFERENCES child_jobs(id) ON DELETE CASCADE,
    seq_id INTEGER NOT NULL,
    coord_x REAL NOT NULL,
    coord_y REAL NOT NULL,
    PRIMARY KEY (child_id, seq_id)
);
"#;

/// BIC sweeps: jobs, per-component best trials, score log.
pub const SWEEP_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS gmm_jobs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    target_child_id TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    stopped_at INTEGER,
    suspended_secs INTEGER NOT NULL DEFAULT 0,
    min_components INTEGER NOT NULL,
    max_components INTEGER NOT NULL,
    step_size INTEGER NOT NULL,
    trials_per_component INTEGER NOT NULL,
    current_components INTEGER NOT NULL,
    worker_id TEXT,
    error_msg TEXT
);

CREATE INDEX IF NOT EXISTS idx_gmm_jobs_status ON gmm_jobs(status);

CREATE TABLE IF NOT EXISTS gmm_trials (
    gmm_job_id TEXT NOT NULL REFERENCES gmm_jobs(id) ON DELETE CASCADE,
    n_components INTEGER NOT NULL,
    trials_completed INTEGER NOT NULL DEFAULT 0,
    trials_total INTEGER NOT NULL,
    best_bic REAL,
    params_json TEXT,
    PRIMARY KEY (gmm_job_id, n_components)
);

CREATE TABLE IF NOT EXISTS gmm_bic_scores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    gmm_job_id TEXT NOT NULL REFERENCES gmm_jobs(id) ON DELETE CASCADE,
    n_components INTEGER NOT NULL,
    bic REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gmm_bic_job ON gmm_bic_scores(gmm_job_id);
"#;
