//! Lifecycle hooks and parent status aggregation.
//!
//! Runners never write a parent's status. Every work-unit event goes through
//! [`LifecycleHooks`], which persists the unit's new status, recomputes the
//! parent from all of its siblings and then bumps a version counter that
//! blocking waiters watch.

use std::sync::Arc;

use parking_lot::Mutex;
use raptgen_core::Result;
use raptgen_store::{JobStatus, SqliteStore};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Parent status as a function of its children's statuses.
///
/// `trigger` is the status of the child whose event caused the
/// recomputation. Precedence:
/// 1. any child pending or in progress: `progress`
/// 2. any child suspended: `suspend` if the trigger is `suspend`, else `progress`
/// 3. any child succeeded: `success`
/// 4. otherwise `failure`
pub fn aggregate_parent_status(children: &[JobStatus], trigger: JobStatus) -> JobStatus {
    let any = |status: JobStatus| children.iter().any(|c| *c == status);

    if any(JobStatus::Pending) || any(JobStatus::Progress) {
        JobStatus::Progress
    } else if any(JobStatus::Suspend) {
        if trigger == JobStatus::Suspend {
            JobStatus::Suspend
        } else {
            JobStatus::Progress
        }
    } else if any(JobStatus::Success) {
        JobStatus::Success
    } else {
        JobStatus::Failure
    }
}

pub struct LifecycleHooks {
    store: Arc<SqliteStore>,
    version: watch::Sender<u64>,
    /// Held from a unit's write until its parent is recomputed.
    transitions: Mutex<()>,
}

impl LifecycleHooks {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            store,
            version,
            transitions: Mutex::new(()),
        }
    }

    /// Receiver that changes after every persisted transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn publish(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    // ---------------------------------------------------------------
    // Work-units
    // ---------------------------------------------------------------

    /// Put a suspended unit back on the queue under `worker_id`.
    ///
    /// Returns `false` when the unit was not suspended, e.g. because a
    /// concurrent resume already claimed it. The caller must not dispatch
    /// in that case.
    pub fn on_requeued(&self, child_id: &str, worker_id: &str) -> Result<bool> {
        let _guard = self.transitions.lock();
        if !self.store.requeue_child(child_id, worker_id)? {
            return Ok(false);
        }
        self.recompute_parent(child_id, JobStatus::Pending)?;
        Ok(true)
    }

    pub fn on_start(&self, child_id: &str) -> Result<()> {
        self.transition(child_id, JobStatus::Progress, None)
    }

    pub fn on_success(&self, child_id: &str) -> Result<()> {
        info!("Work-unit {} succeeded", child_id);
        self.transition(child_id, JobStatus::Success, None)
    }

    pub fn on_suspend(&self, child_id: &str) -> Result<()> {
        info!("Work-unit {} suspended", child_id);
        self.transition(child_id, JobStatus::Suspend, None)
    }

    pub fn on_failure(&self, child_id: &str, error: &str) -> Result<()> {
        warn!("Work-unit {} failed: {}", child_id, error);
        self.transition(child_id, JobStatus::Failure, Some(error))
    }

    /// Suspend a unit that no live task owns.
    ///
    /// Applies only while the unit is still active and still assigned to
    /// `worker_id`; a unit re-queued under a new worker is left alone.
    pub fn on_orphan_suspend(&self, child_id: &str, worker_id: Option<&str>) -> Result<bool> {
        let _guard = self.transitions.lock();
        let Some(child) = self.store.get_child(child_id)? else {
            return Ok(false);
        };
        if !child.status.is_active() || child.worker_id.as_deref() != worker_id {
            return Ok(false);
        }
        info!("Work-unit {} suspended without a live task", child_id);
        self.store.set_child_status(child_id, JobStatus::Suspend, None)?;
        self.recompute_parent(child_id, JobStatus::Suspend)?;
        Ok(true)
    }

    fn transition(&self, child_id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        let _guard = self.transitions.lock();
        // The unit may have been deleted underneath a running task
        if !self.store.set_child_status(child_id, status, error)? {
            warn!("Work-unit {} vanished before it could be marked {}", child_id, status);
            return Ok(());
        }
        self.recompute_parent(child_id, status)
    }

    fn recompute_parent(&self, child_id: &str, status: JobStatus) -> Result<()> {
        let Some(child) = self.store.get_child(child_id)? else {
            return Ok(());
        };

        let siblings: Vec<JobStatus> = self
            .store
            .list_children(&child.parent_id)?
            .iter()
            .map(|c| c.status)
            .collect();
        let parent_status = aggregate_parent_status(&siblings, status);
        self.store.set_parent_status(&child.parent_id, parent_status)?;
        debug!(
            "Work-unit {} -> {}, parent {} -> {}",
            child_id, status, child.parent_id, parent_status
        );

        self.publish();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Sweeps (single-unit jobs, no aggregation)
    // ---------------------------------------------------------------

    /// Sweep counterpart of [`LifecycleHooks::on_requeued`].
    pub fn on_sweep_requeued(&self, sweep_id: &str, worker_id: &str) -> Result<bool> {
        let _guard = self.transitions.lock();
        if !self.store.requeue_sweep(sweep_id, worker_id)? {
            return Ok(false);
        }
        self.publish();
        Ok(true)
    }

    pub fn on_sweep_start(&self, sweep_id: &str) -> Result<()> {
        self.sweep_transition(sweep_id, JobStatus::Progress, None)
    }

    pub fn on_sweep_success(&self, sweep_id: &str) -> Result<()> {
        info!("Sweep {} succeeded", sweep_id);
        self.sweep_transition(sweep_id, JobStatus::Success, None)
    }

    pub fn on_sweep_suspend(&self, sweep_id: &str) -> Result<()> {
        info!("Sweep {} suspended", sweep_id);
        self.sweep_transition(sweep_id, JobStatus::Suspend, None)
    }

    pub fn on_sweep_failure(&self, sweep_id: &str, error: &str) -> Result<()> {
        warn!("Sweep {} failed: {}", sweep_id, error);
        self.sweep_transition(sweep_id, JobStatus::Failure, Some(error))
    }

    /// Sweep counterpart of [`LifecycleHooks::on_orphan_suspend`].
    pub fn on_orphan_sweep_suspend(&self, sweep_id: &str, worker_id: Option<&str>) -> Result<bool> {
        let _guard = self.transitions.lock();
        let Some(sweep) = self.store.get_sweep(sweep_id)? else {
            return Ok(false);
        };
        if !sweep.status.is_active() || sweep.worker_id.as_deref() != worker_id {
            return Ok(false);
        }
        info!("Sweep {} suspended without a live task", sweep_id);
        self.store.set_sweep_status(sweep_id, JobStatus::Suspend, None)?;
        self.publish();
        Ok(true)
    }

    fn sweep_transition(&self, sweep_id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        let _guard = self.transitions.lock();
        if !self.store.set_sweep_status(sweep_id, status, error)? {
            warn!("Sweep {} vanished before it could be marked {}", sweep_id, status);
            return Ok(());
        }
        self.publish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raptgen_store::{JobKind, NewParentJob};
    use JobStatus::*;

    #[test]
    fn test_aggregation_precedence_table() {
        let cases = vec![
            (vec![Pending, Pending], Pending, Progress),
            (vec![Progress, Success], Success, Progress),
            (vec![Pending, Suspend], Suspend, Progress),
            (vec![Progress, Failure], Failure, Progress),
            (vec![Suspend, Suspend], Suspend, Suspend),
            (vec![Suspend, Success], Suspend, Suspend),
            (vec![Suspend, Success], Success, Progress),
            (vec![Suspend, Failure], Failure, Progress),
            (vec![Suspend, Failure], Suspend, Suspend),
            (vec![Success, Failure], Failure, Success),
            (vec![Success, Success], Success, Success),
            (vec![Failure, Failure], Failure, Failure),
            (vec![Success], Success, Success),
            (vec![Failure], Failure, Failure),
            (vec![Suspend], Suspend, Suspend),
        ];
        for (children, trigger, expected) in cases {
            assert_eq!(
                aggregate_parent_status(&children, trigger),
                expected,
                "children={:?} trigger={:?}",
                children,
                trigger
            );
        }
    }

    #[test]
    fn test_aggregation_exhaustive_pairs() {
        // Any active sibling always wins
        for a in JobStatus::ALL {
            for b in JobStatus::ALL {
                for trigger in [a, b] {
                    let status = aggregate_parent_status(&[a, b], trigger);
                    if a.is_active() || b.is_active() {
                        assert_eq!(status, Progress);
                    } else if a == Suspend || b == Suspend {
                        let expected = if trigger == Suspend { Suspend } else { Progress };
                        assert_eq!(status, expected);
                    } else if a == Success || b == Success {
                        assert_eq!(status, Success);
                    } else {
                        assert_eq!(status, Failure);
                    }
                }
            }
        }
    }

    fn store_with_parent(reiteration: u32) -> (Arc<SqliteStore>, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let parent_id = store
            .create_parent(&NewParentJob {
                name: "hooks".into(),
                kind: JobKind::RaptGen,
                reiteration,
                steps_total: 3,
                params: serde_json::json!({}),
                random_regions: vec!["ACGT".into()],
                duplicates: vec![],
            })
            .unwrap();
        (store, parent_id, dir)
    }

    #[test]
    fn test_mixed_suspend_and_success() {
        let (store, parent_id, _dir) = store_with_parent(2);
        let hooks = LifecycleHooks::new(Arc::clone(&store));
        let children = store.list_children(&parent_id).unwrap();

        hooks.on_start(&children[0].id).unwrap();
        hooks.on_start(&children[1].id).unwrap();
        assert_eq!(store.get_parent(&parent_id).unwrap().unwrap().status, Progress);

        hooks.on_success(&children[1].id).unwrap();
        hooks.on_suspend(&children[0].id).unwrap();
        assert_eq!(store.get_parent(&parent_id).unwrap().unwrap().status, Suspend);

        // Re-queueing a suspended unit takes the parent out of suspend at once
        assert!(hooks.on_requeued(&children[0].id, "w-1").unwrap());
        assert_eq!(store.get_parent(&parent_id).unwrap().unwrap().status, Progress);
    }

    #[test]
    fn test_requeue_is_claimed_once() {
        let (store, parent_id, _dir) = store_with_parent(1);
        let hooks = LifecycleHooks::new(Arc::clone(&store));
        let mut rx = hooks.subscribe();
        let child = &store.list_children(&parent_id).unwrap()[0];

        hooks.on_start(&child.id).unwrap();
        hooks.on_suspend(&child.id).unwrap();
        rx.borrow_and_update();

        assert!(hooks.on_requeued(&child.id, "w-1").unwrap());
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        // The loser changes nothing and wakes nobody
        assert!(!hooks.on_requeued(&child.id, "w-2").unwrap());
        assert!(!rx.has_changed().unwrap());
        let child = store.get_child(&child.id).unwrap().unwrap();
        assert_eq!(child.status, Pending);
        assert_eq!(child.worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_orphan_suspend_respects_worker() {
        let (store, parent_id, _dir) = store_with_parent(1);
        let hooks = LifecycleHooks::new(Arc::clone(&store));
        let child = &store.list_children(&parent_id).unwrap()[0];

        store.set_child_worker(&child.id, "w-old").unwrap();
        hooks.on_start(&child.id).unwrap();
        hooks.on_suspend(&child.id).unwrap();
        assert!(hooks.on_requeued(&child.id, "w-new").unwrap());

        // A stale worker id must not flip the freshly queued unit back
        assert!(!hooks.on_orphan_suspend(&child.id, Some("w-old")).unwrap());
        assert_eq!(store.get_child(&child.id).unwrap().unwrap().status, Pending);

        assert!(hooks.on_orphan_suspend(&child.id, Some("w-new")).unwrap());
        assert_eq!(store.get_child(&child.id).unwrap().unwrap().status, Suspend);
        assert_eq!(store.get_parent(&parent_id).unwrap().unwrap().status, Suspend);

        // Already stopped
        assert!(!hooks.on_orphan_suspend(&child.id, Some("w-new")).unwrap());
    }

    #[test]
    fn test_failure_records_error_and_publishes() {
        let (store, parent_id, _dir) = store_with_parent(1);
        let hooks = LifecycleHooks::new(Arc::clone(&store));
        let mut rx = hooks.subscribe();
        let child = &store.list_children(&parent_id).unwrap()[0];

        hooks.on_start(&child.id).unwrap();
        hooks.on_failure(&child.id, "out of memory").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 2);

        let child = store.get_child(&child.id).unwrap().unwrap();
        assert_eq!(child.status, Failure);
        assert_eq!(child.error_msg.as_deref(), Some("out of memory"));
        assert_eq!(store.get_parent(&parent_id).unwrap().unwrap().status, Failure);
    }

    #[test]
    fn test_missing_unit_is_ignored() {
        let (store, _parent_id, _dir) = store_with_parent(1);
        let hooks = LifecycleHooks::new(store);
        assert!(hooks.on_failure("gone", "boom").is_ok());
        assert!(hooks.on_sweep_suspend("gone").is_ok());
    }
}
