//! SQLite-backed job record store.
//!
//! Every mutation the runners make for one step (or one sweep trial) goes
//! through a single transaction, so a crash never leaves a progress row
//! without its matching counters and checkpoint, or the reverse.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::schema::{JOBS_SCHEMA_SQL, SWEEP_SCHEMA_SQL};
use crate::types::*;
use raptgen_core::{now_secs, Error, Result};

const PARENT_COLUMNS: &str = "id, name, kind, status, created_at, started_at, stopped_at, \
     suspended_secs, reiteration, params_json";

const CHILD_COLUMNS: &str = "id, parent_id, child_index, worker_id, status, started_at, \
     steps_total, steps_completed, best_metric, error_msg";

const SWEEP_COLUMNS: &str = "id, name, target_child_id, status, created_at, started_at, \
     stopped_at, suspended_secs, min_components, max_components, step_size, \
     trials_per_component, current_components, worker_id, error_msg";

fn db(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// Parse a TEXT column through `FromStr`.
fn parse_text<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        serde_json::from_str(&t).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

/// `?, ?, ?` for an IN list.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// SQLite store for job records.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create the store.
    ///
    /// `db_dir` is the directory (e.g., `data/db/`). The file will be `db_dir/raptgen.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("raptgen.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let parent_count = store.count_rows("parent_jobs")?;
        let sweep_count = store.count_rows("gmm_jobs")?;
        info!(
            "SqliteStore initialized: {} parent jobs, {} sweeps, path={}",
            parent_count,
            sweep_count,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", JOBS_SCHEMA_SQL, SWEEP_SCHEMA_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn count_rows(&self, table: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .map_err(db)
    }

    /// Apply a status transition with duration bookkeeping.
    ///
    /// Entering `progress` stamps `started_at` once and folds the time since
    /// the last stop into `suspended_secs`; entering a stopped status stamps
    /// `stopped_at`.
    fn transition(conn: &Connection, table: &str, id: &str, status: JobStatus) -> Result<bool> {
        let now = now_secs();
        let row: Option<(String, Option<i64>, Option<i64>)> = conn
            .prepare_cached(&format!(
                "SELECT status, started_at, stopped_at FROM {} WHERE id = ?1",
                table
            ))
            .map_err(db)?
            .query_row(params![id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .optional()
            .map_err(db)?;
        let Some((old, started_at, stopped_at)) = row else {
            return Ok(false);
        };
        let old: JobStatus = old.parse()?;

        let (started_at, stopped_at, paused) = match status {
            JobStatus::Progress => {
                let paused = match (started_at, stopped_at) {
                    (Some(_), Some(stop)) => (now - stop).max(0),
                    _ => 0,
                };
                (started_at.or(Some(now)), None, paused)
            }
            JobStatus::Pending => (started_at, stopped_at, 0),
            JobStatus::Suspend | JobStatus::Success | JobStatus::Failure => {
                let stop = if old == status {
                    stopped_at.or(Some(now))
                } else {
                    Some(now)
                };
                (started_at, stop, 0)
            }
        };

        conn.prepare_cached(&format!(
            "UPDATE {} SET status = ?1, started_at = ?2, stopped_at = ?3, \
             suspended_secs = suspended_secs + ?4 WHERE id = ?5",
            table
        ))
        .map_err(db)?
        .execute(params![status.as_str(), started_at, stopped_at, paused, id])
        .map_err(db)?;
        Ok(true)
    }

    // ---------------------------------------------------------------
    // Parent jobs
    // ---------------------------------------------------------------

    /// Insert a parent job with its sequences and `reiteration` pending
    /// work-units in one transaction. Returns the new parent id.
    pub fn create_parent(&self, job: &NewParentJob) -> Result<String> {
        let parent_id = uuid::Uuid::new_v4().to_string();
        let params_json = serde_json::to_string(&job.params)?;
        let now = now_secs();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "INSERT INTO parent_jobs (id, name, kind, status, created_at, reiteration, params_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                parent_id,
                job.name,
                job.kind.as_str(),
                JobStatus::Pending.as_str(),
                now,
                job.reiteration,
                params_json,
            ],
        )
        .map_err(db)?;

        {
            let total = job.random_regions.len() as f64;
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO sequence_data (parent_id, seq_id, random_region, duplicate, is_training) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(db)?;
            for (seq_id, region) in job.random_regions.iter().enumerate() {
                let duplicate = job.duplicates.get(seq_id).copied().unwrap_or(1);
                let is_training = (seq_id as f64) < total * TRAINING_SPLIT;
                stmt.execute(params![parent_id, seq_id as i64, region, duplicate, is_training])
                    .map_err(db)?;
            }
        }

        for index in 0..job.reiteration {
            Self::insert_child(&tx, &parent_id, index, job.steps_total)?;
        }
        tx.commit().map_err(db)?;

        debug!(
            "Created parent job {} with {} work-units",
            parent_id, job.reiteration
        );
        Ok(parent_id)
    }

    /// Get a parent job by ID.
    pub fn get_parent(&self, parent_id: &str) -> Result<Option<ParentJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM parent_jobs WHERE id = ?1",
            PARENT_COLUMNS
        )).map_err(db)?;
        let row = stmt
            .query_row(params![parent_id], Self::row_to_parent)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// List parent jobs, newest first.
    pub fn list_parents(&self, filter: &JobFilter) -> Result<Vec<ParentJob>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(statuses) = &filter.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("status IN ({})", placeholders(statuses.len())));
            values.extend(statuses.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(kinds) = &filter.kinds {
            if kinds.is_empty() {
                return Ok(Vec::new());
            }
            clauses.push(format!("kind IN ({})", placeholders(kinds.len())));
            values.extend(kinds.iter().map(|k| k.as_str().to_string()));
        }
        match filter.multiple {
            Some(true) => clauses.push("reiteration > 1".to_string()),
            Some(false) => clauses.push("reiteration = 1".to_string()),
            None => {}
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM parent_jobs {} ORDER BY created_at DESC, rowid DESC",
            PARENT_COLUMNS, where_sql
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(db)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_parent)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Set a parent's status. Returns false if the parent does not exist.
    pub fn set_parent_status(&self, parent_id: &str, status: JobStatus) -> Result<bool> {
        let conn = self.conn.lock();
        Self::transition(&conn, "parent_jobs", parent_id, status)
    }

    pub fn rename_parent(&self, parent_id: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE parent_jobs SET name = ?1 WHERE id = ?2",
                params![name, parent_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Delete a parent and, by cascade, its work-units, progress logs,
    /// checkpoints, sequences and embeddings.
    pub fn delete_parent(&self, parent_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM parent_jobs WHERE id = ?1", params![parent_id])
            .map_err(db)?;
        Ok(count > 0)
    }

    // ---------------------------------------------------------------
    // Work-units
    // ---------------------------------------------------------------

    fn insert_child(conn: &Connection, parent_id: &str, index: u32, steps_total: u32) -> Result<String> {
        let child_id = uuid::Uuid::new_v4().to_string();
        conn.prepare_cached(
            "INSERT INTO child_jobs (id, parent_id, child_index, status, steps_total) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(db)?
        .execute(params![
            child_id,
            parent_id,
            index,
            JobStatus::Pending.as_str(),
            steps_total
        ])
        .map_err(db)?;
        Ok(child_id)
    }

    /// Insert a pending work-unit under an existing parent.
    pub fn create_child(&self, parent_id: &str, index: u32, steps_total: u32) -> Result<String> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM parent_jobs WHERE id = ?1",
                params![parent_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("parent job {}", parent_id)));
        }
        Self::insert_child(&conn, parent_id, index, steps_total)
    }

    pub fn get_child(&self, child_id: &str) -> Result<Option<ChildJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM child_jobs WHERE id = ?1",
            CHILD_COLUMNS
        )).map_err(db)?;
        let row = stmt
            .query_row(params![child_id], Self::row_to_child)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    pub fn get_child_by_index(&self, parent_id: &str, index: u32) -> Result<Option<ChildJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM child_jobs WHERE parent_id = ?1 AND child_index = ?2",
            CHILD_COLUMNS
        )).map_err(db)?;
        let row = stmt
            .query_row(params![parent_id, index], Self::row_to_child)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// All work-units of a parent, ordered by index.
    pub fn list_children(&self, parent_id: &str) -> Result<Vec<ChildJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {} FROM child_jobs WHERE parent_id = ?1 ORDER BY child_index",
                CHILD_COLUMNS
            ))
            .map_err(db)?;
        let rows = stmt
            .query_map(params![parent_id], Self::row_to_child)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Work-units in any of the given statuses, across all parents.
    pub fn list_children_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<ChildJob>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM child_jobs WHERE status IN ({}) ORDER BY parent_id, child_index",
            CHILD_COLUMNS,
            placeholders(statuses.len())
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(db)?;
        let rows = stmt
            .query_map(
                params_from_iter(statuses.iter().map(|s| s.as_str())),
                Self::row_to_child,
            )
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Record the task identity now responsible for a work-unit.
    pub fn set_child_worker(&self, child_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE child_jobs SET worker_id = ?1 WHERE id = ?2",
                params![worker_id, child_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Set a work-unit's status, keeping any earlier error unless a new one is given.
    pub fn set_child_status(
        &self,
        child_id: &str,
        status: JobStatus,
        error_msg: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .prepare_cached(
                "UPDATE child_jobs SET status = ?1, error_msg = COALESCE(?2, error_msg), \
                 started_at = CASE WHEN ?1 = 'progress' AND started_at IS NULL THEN ?3 ELSE started_at END \
                 WHERE id = ?4",
            )
            .map_err(db)?
            .execute(params![status.as_str(), error_msg, now_secs(), child_id])
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Move a suspended work-unit back to `pending` under a fresh worker id.
    ///
    /// Returns `false` without writing anything unless the unit is currently
    /// suspended, so only one of several concurrent callers wins.
    pub fn requeue_child(&self, child_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .prepare_cached(
                "UPDATE child_jobs SET status = 'pending', worker_id = ?1 \
                 WHERE id = ?2 AND status = 'suspend'",
            )
            .map_err(db)?
            .execute(params![worker_id, child_id])
            .map_err(db)?;
        Ok(count > 0)
    }

    // ---------------------------------------------------------------
    // Progress log and checkpoints
    // ---------------------------------------------------------------

    /// Append one progress row without touching the unit record.
    pub fn append_progress_log(
        &self,
        child_id: &str,
        epoch: u32,
        metrics: &StepMetrics,
    ) -> Result<()> {
        let conn = self.conn.lock();
        Self::insert_progress(&conn, child_id, epoch, metrics)
    }

    fn insert_progress(
        conn: &Connection,
        child_id: &str,
        epoch: u32,
        metrics: &StepMetrics,
    ) -> Result<()> {
        conn.prepare_cached(
            "INSERT INTO training_losses (child_id, epoch, train_loss, test_loss, test_recon, test_kld) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(db)?
        .execute(params![
            child_id,
            epoch,
            metrics.train_loss,
            metrics.test_loss,
            metrics.test_recon,
            metrics.test_kld,
        ])
        .map_err(db)?;
        Ok(())
    }

    /// Progress rows of a unit, ordered by epoch.
    pub fn list_progress_log(&self, child_id: &str) -> Result<Vec<ProgressLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT epoch, train_loss, test_loss, test_recon, test_kld FROM training_losses \
                 WHERE child_id = ?1 ORDER BY epoch",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![child_id], Self::row_to_progress)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// The row with the lowest validation loss; the earliest epoch wins ties.
    pub fn best_progress_entry(&self, child_id: &str) -> Result<Option<ProgressLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT epoch, train_loss, test_loss, test_recon, test_kld FROM training_losses \
             WHERE child_id = ?1 ORDER BY test_loss ASC, epoch ASC LIMIT 1",
        ).map_err(db)?;
        let row = stmt
            .query_row(params![child_id], Self::row_to_progress)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    pub fn write_checkpoint(&self, child_id: &str, slot: CheckpointSlot, bytes: &[u8]) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                &format!("UPDATE child_jobs SET {} = ?1 WHERE id = ?2", slot.column()),
                params![bytes, child_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Read a checkpoint slot. `Ok(None)` if the slot has never been written.
    pub fn read_checkpoint(&self, child_id: &str, slot: CheckpointSlot) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let row: Option<Option<Vec<u8>>> = conn
            .query_row(
                &format!("SELECT {} FROM child_jobs WHERE id = ?1", slot.column()),
                params![child_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        row.ok_or_else(|| Error::NotFound(format!("work-unit {}", child_id)))
    }

    /// Persist one completed training step atomically: the progress row,
    /// `steps_completed`, the current checkpoint and, on improvement, the
    /// best metric, the optimal checkpoint and the latent embeddings.
    ///
    /// Steps must be committed in order: `epoch` has to equal the unit's
    /// `steps_completed` and stay below `steps_total`.
    pub fn commit_training_step(&self, child_id: &str, commit: &StepCommit<'_>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db)?;

        let counters: Option<(u32, u32)> = tx
            .query_row(
                "SELECT steps_completed, steps_total FROM child_jobs WHERE id = ?1",
                params![child_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db)?;
        let (completed, total) =
            counters.ok_or_else(|| Error::NotFound(format!("work-unit {}", child_id)))?;
        if commit.epoch != completed || commit.epoch >= total {
            return Err(Error::InvalidState(format!(
                "work-unit {} cannot commit epoch {} ({} of {} steps completed)",
                child_id, commit.epoch, completed, total
            )));
        }

        Self::insert_progress(&tx, child_id, commit.epoch, &commit.metrics)?;
        tx.execute(
            "UPDATE child_jobs SET steps_completed = ?1, current_checkpoint = ?2 WHERE id = ?3",
            params![commit.epoch + 1, commit.current_checkpoint, child_id],
        )
        .map_err(db)?;

        if let Some(improvement) = &commit.improvement {
            tx.execute(
                "UPDATE child_jobs SET best_metric = ?1, optimal_checkpoint = current_checkpoint \
                 WHERE id = ?2",
                params![improvement.best_metric, child_id],
            )
            .map_err(db)?;
            tx.execute(
                "DELETE FROM sequence_embeddings WHERE child_id = ?1",
                params![child_id],
            )
            .map_err(db)?;
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO sequence_embeddings (child_id, seq_id, coord_x, coord_y) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db)?;
            for point in improvement.embeddings {
                stmt.execute(params![child_id, point.seq_id, point.coord_x, point.coord_y])
                    .map_err(db)?;
            }
        }

        tx.commit().map_err(db)?;
        Ok(())
    }

    /// Latent coordinates of a unit's best state, ordered by sequence.
    pub fn list_embeddings(&self, child_id: &str) -> Result<Vec<LatentPoint>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT seq_id, coord_x, coord_y FROM sequence_embeddings \
                 WHERE child_id = ?1 ORDER BY seq_id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![child_id], |row| {
                Ok(LatentPoint {
                    seq_id: row.get(0)?,
                    coord_x: row.get(1)?,
                    coord_y: row.get(2)?,
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Training sequences of a parent, ordered by sequence id.
    pub fn list_sequences(&self, parent_id: &str) -> Result<Vec<SequenceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT seq_id, random_region, duplicate, is_training FROM sequence_data \
                 WHERE parent_id = ?1 ORDER BY seq_id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![parent_id], |row| {
                Ok(SequenceRecord {
                    seq_id: row.get(0)?,
                    random_region: row.get(1)?,
                    duplicate: row.get(2)?,
                    is_training: row.get(3)?,
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    // ---------------------------------------------------------------
    // BIC sweeps
    // ---------------------------------------------------------------

    /// Insert a pending sweep and one empty trial record per component count.
    pub fn create_sweep(&self, sweep: &NewSweepJob) -> Result<String> {
        sweep.validate()?;
        let sweep_id = uuid::Uuid::new_v4().to_string();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "INSERT INTO gmm_jobs (id, name, target_child_id, status, created_at, min_components, \
             max_components, step_size, trials_per_component, current_components) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?6)",
            params![
                sweep_id,
                sweep.name,
                sweep.target_child_id,
                JobStatus::Pending.as_str(),
                now_secs(),
                sweep.min_components,
                sweep.max_components,
                sweep.step_size,
                sweep.trials_per_component,
            ],
        )
        .map_err(db)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO gmm_trials (gmm_job_id, n_components, trials_total) VALUES (?1, ?2, ?3)",
                )
                .map_err(db)?;
            for n_components in sweep.component_counts() {
                stmt.execute(params![sweep_id, n_components, sweep.trials_per_component])
                    .map_err(db)?;
            }
        }
        tx.commit().map_err(db)?;
        Ok(sweep_id)
    }

    pub fn get_sweep(&self, sweep_id: &str) -> Result<Option<SweepJob>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("SELECT {} FROM gmm_jobs WHERE id = ?1", SWEEP_COLUMNS)).map_err(db)?;
        let row = stmt
            .query_row(params![sweep_id], Self::row_to_sweep)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// List sweeps, newest first, optionally restricted to some statuses.
    pub fn list_sweeps(&self, statuses: Option<&[JobStatus]>) -> Result<Vec<SweepJob>> {
        let (where_sql, values): (String, Vec<&str>) = match statuses {
            Some([]) => return Ok(Vec::new()),
            Some(statuses) => (
                format!("WHERE status IN ({})", placeholders(statuses.len())),
                statuses.iter().map(|s| s.as_str()).collect(),
            ),
            None => (String::new(), Vec::new()),
        };
        let sql = format!(
            "SELECT {} FROM gmm_jobs {} ORDER BY created_at DESC, rowid DESC",
            SWEEP_COLUMNS, where_sql
        );
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(db)?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::row_to_sweep)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Set a sweep's status; `error_msg` is recorded when given.
    pub fn set_sweep_status(
        &self,
        sweep_id: &str,
        status: JobStatus,
        error_msg: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        if !Self::transition(&conn, "gmm_jobs", sweep_id, status)? {
            return Ok(false);
        }
        if let Some(msg) = error_msg {
            conn.execute(
                "UPDATE gmm_jobs SET error_msg = ?1 WHERE id = ?2",
                params![msg, sweep_id],
            )
            .map_err(db)?;
        }
        Ok(true)
    }

    /// Move a suspended sweep back to `pending` under a fresh worker id.
    /// Returns `false` unless the sweep is currently suspended.
    pub fn requeue_sweep(&self, sweep_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM gmm_jobs WHERE id = ?1",
                params![sweep_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db)?;
        if status.as_deref() != Some(JobStatus::Suspend.as_str()) {
            return Ok(false);
        }
        Self::transition(&conn, "gmm_jobs", sweep_id, JobStatus::Pending)?;
        conn.execute(
            "UPDATE gmm_jobs SET worker_id = ?1 WHERE id = ?2",
            params![worker_id, sweep_id],
        )
        .map_err(db)?;
        Ok(true)
    }

    pub fn set_sweep_worker(&self, sweep_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE gmm_jobs SET worker_id = ?1 WHERE id = ?2",
                params![worker_id, sweep_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Progress marker: the component count currently being fitted.
    pub fn set_sweep_current_components(&self, sweep_id: &str, n_components: u32) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE gmm_jobs SET current_components = ?1 WHERE id = ?2",
                params![n_components, sweep_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    pub fn rename_sweep(&self, sweep_id: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE gmm_jobs SET name = ?1 WHERE id = ?2",
                params![name, sweep_id],
            )
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Delete a sweep with its trials and score log.
    pub fn delete_sweep(&self, sweep_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM gmm_jobs WHERE id = ?1", params![sweep_id])
            .map_err(db)?;
        Ok(count > 0)
    }

    /// Trial records of a sweep in ascending component order.
    pub fn list_trials(&self, sweep_id: &str) -> Result<Vec<SweepTrial>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT n_components, trials_completed, trials_total, best_bic, params_json \
                 FROM gmm_trials WHERE gmm_job_id = ?1 ORDER BY n_components",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![sweep_id], Self::row_to_trial)
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    pub fn get_trial(&self, sweep_id: &str, n_components: u32) -> Result<Option<SweepTrial>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT n_components, trials_completed, trials_total, best_bic, params_json \
             FROM gmm_trials WHERE gmm_job_id = ?1 AND n_components = ?2",
        ).map_err(db)?;
        let row = stmt
            .query_row(params![sweep_id, n_components], Self::row_to_trial)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// The trial with the lowest BIC across all component counts.
    pub fn best_trial(&self, sweep_id: &str) -> Result<Option<SweepTrial>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT n_components, trials_completed, trials_total, best_bic, params_json \
             FROM gmm_trials WHERE gmm_job_id = ?1 AND best_bic IS NOT NULL \
             ORDER BY best_bic ASC, n_components ASC LIMIT 1",
        ).map_err(db)?;
        let row = stmt
            .query_row(params![sweep_id], Self::row_to_trial)
            .optional()
            .map_err(db)?;
        Ok(row)
    }

    /// Persist one completed fit atomically: append the score, keep the
    /// parameters if the score is strictly lower than the best so far, and
    /// count the trial. Fails if the component count is already exhausted.
    pub fn commit_sweep_trial(
        &self,
        sweep_id: &str,
        n_components: u32,
        bic: f64,
        params: &MixtureParams,
    ) -> Result<SweepTrial> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db)?;

        let trial = tx
            .query_row(
                "SELECT n_components, trials_completed, trials_total, best_bic, params_json \
                 FROM gmm_trials WHERE gmm_job_id = ?1 AND n_components = ?2",
                params![sweep_id, n_components],
                Self::row_to_trial,
            )
            .optional()
            .map_err(db)?
            .ok_or_else(|| {
                Error::NotFound(format!("sweep {} trial for {} components", sweep_id, n_components))
            })?;
        if trial.is_exhausted() {
            return Err(Error::InvalidState(format!(
                "sweep {} already completed {} of {} trials for {} components",
                sweep_id, trial.trials_completed, trial.trials_total, n_components
            )));
        }

        tx.execute(
            "INSERT INTO gmm_bic_scores (gmm_job_id, n_components, bic) VALUES (?1, ?2, ?3)",
            params![sweep_id, n_components, bic],
        )
        .map_err(db)?;

        let improved = trial.best_bic.map_or(true, |best| bic < best);
        if improved {
            tx.execute(
                "UPDATE gmm_trials SET best_bic = ?1, params_json = ?2 \
                 WHERE gmm_job_id = ?3 AND n_components = ?4",
                params![bic, serde_json::to_string(params)?, sweep_id, n_components],
            )
            .map_err(db)?;
        }
        tx.execute(
            "UPDATE gmm_trials SET trials_completed = trials_completed + 1 \
             WHERE gmm_job_id = ?1 AND n_components = ?2",
            params![sweep_id, n_components],
        )
        .map_err(db)?;
        tx.commit().map_err(db)?;

        Ok(SweepTrial {
            trials_completed: trial.trials_completed + 1,
            best_bic: if improved { Some(bic) } else { trial.best_bic },
            params: if improved { Some(params.clone()) } else { trial.params },
            ..trial
        })
    }

    /// The score log in insertion order.
    pub fn list_bic_scores(&self, sweep_id: &str) -> Result<Vec<BicScore>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT n_components, bic FROM gmm_bic_scores WHERE gmm_job_id = ?1 ORDER BY id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(params![sweep_id], |row| {
                Ok(BicScore {
                    n_components: row.get(0)?,
                    bic: row.get(1)?,
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    // ---------------------------------------------------------------
    // Row mapping
    // ---------------------------------------------------------------

    fn row_to_parent(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParentJob> {
        Ok(ParentJob {
            id: row.get(0)?,
            name: row.get(1)?,
            kind: parse_text(row, 2)?,
            status: parse_text(row, 3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            stopped_at: row.get(6)?,
            suspended_secs: row.get(7)?,
            reiteration: row.get(8)?,
            params: parse_json(row, 9)?.unwrap_or(serde_json::Value::Null),
        })
    }

    fn row_to_child(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChildJob> {
        Ok(ChildJob {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            index: row.get(2)?,
            worker_id: row.get(3)?,
            status: parse_text(row, 4)?,
            started_at: row.get(5)?,
            steps_total: row.get(6)?,
            steps_completed: row.get(7)?,
            best_metric: row.get(8)?,
            error_msg: row.get(9)?,
        })
    }

    fn row_to_progress(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressLogEntry> {
        Ok(ProgressLogEntry {
            epoch: row.get(0)?,
            metrics: StepMetrics {
                train_loss: row.get(1)?,
                test_loss: row.get(2)?,
                test_recon: row.get(3)?,
                test_kld: row.get(4)?,
            },
        })
    }

    fn row_to_sweep(row: &rusqlite::Row<'_>) -> rusqlite::Result<SweepJob> {
        Ok(SweepJob {
            id: row.get(0)?,
            name: row.get(1)?,
            target_child_id: row.get(2)?,
            status: parse_text(row, 3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            stopped_at: row.get(6)?,
            suspended_secs: row.get(7)?,
            min_components: row.get(8)?,
            max_components: row.get(9)?,
            step_size: row.get(10)?,
            trials_per_component: row.get(11)?,
            current_components: row.get(12)?,
            worker_id: row.get(13)?,
            error_msg: row.get(14)?,
        })
    }

    fn row_to_trial(row: &rusqlite::Row<'_>) -> rusqlite::Result<SweepTrial> {
        Ok(SweepTrial {
            n_components: row.get(0)?,
            trials_completed: row.get(1)?,
            trials_total: row.get(2)?,
            best_bic: row.get(3)?,
            params: parse_json(row, 4)?,
        })
    }
}
