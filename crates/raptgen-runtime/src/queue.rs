//! In-process task queue with per-task cancellation tokens.
//!
//! Each enqueued unit of work gets a fresh task id (the worker-instance id
//! stored on the unit's record) and a [`CancellationToken`]. Suspension is
//! cooperative: cancelling a token only takes effect at the next step
//! boundary the runner checks.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Default)]
pub struct TaskQueue {
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` under `task_id`. The token handed to `work` is the one
    /// [`cancel`](Self::cancel) trips; it is forgotten once `work` returns.
    pub fn enqueue<F, Fut>(&self, task_id: &str, work: F) -> JoinHandle<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        self.tokens.insert(task_id.to_string(), token.clone());
        debug!("Enqueued task {}", task_id);

        let fut = work(token);
        let tokens = Arc::clone(&self.tokens);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            fut.await;
            tokens.remove(&task_id);
            debug!("Task {} finished", task_id);
        })
    }

    /// Request cooperative cancellation. Returns false if no live task has this id.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.get(task_id) {
            Some(token) => {
                token.cancel();
                debug!("Cancellation requested for task {}", task_id);
                true
            }
            None => false,
        }
    }

    /// Number of tasks not yet finished.
    pub fn live(&self) -> usize {
        self.tokens.len()
    }
}
