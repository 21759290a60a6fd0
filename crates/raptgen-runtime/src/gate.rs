//! Concurrency gate: bounded admission per compute resource class.
//!
//! Every unit of work acquires a permit for its resource class (`CPU`,
//! `CUDA:0`, ...) before running its first step and holds it until it
//! returns. The permit is an owned RAII guard, so it is released on every
//! exit path, including a panic unwinding through the runner. Suspension
//! always releases it; a resumed unit queues for a fresh permit.
//!
//! Pools are created lazily the first time a class is requested, with the
//! capacity from [`GateConfig`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use raptgen_core::{Error, GateConfig, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Semaphore-backed pool for one resource class.
#[derive(Debug)]
pub struct GatePool {
    class: String,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
}

impl GatePool {
    fn new(class: String, capacity: usize) -> Self {
        Self {
            class,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal(format!("gate {} closed", self.class)))?;
        Ok(self.admit(permit))
    }

    fn admit(&self, permit: OwnedSemaphorePermit) -> GatePermit {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::Relaxed);
        GatePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
            class: self.class.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of simultaneous holders observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

/// A held slot. Dropping it frees the slot.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
    class: String,
}

impl GatePermit {
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit")
            .field("class", &self.class)
            .finish()
    }
}

/// One pool per resource class.
pub struct ConcurrencyGate {
    config: GateConfig,
    pools: DashMap<String, Arc<GatePool>>,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
        }
    }

    /// Pool for `class`, created on first use.
    pub fn pool(&self, class: &str) -> Arc<GatePool> {
        let class = class.to_ascii_uppercase();
        let pool = self.pools.entry(class.clone()).or_insert_with(|| {
            let capacity = self.config.capacity_for(&class).max(1);
            debug!("Creating gate pool {} with capacity {}", class, capacity);
            Arc::new(GatePool::new(class.clone(), capacity))
        });
        Arc::clone(pool.value())
    }

    /// Wait for a slot in `class`.
    pub async fn acquire(&self, class: &str) -> Result<GatePermit> {
        let pool = self.pool(class);
        pool.acquire().await
    }

    pub fn in_flight(&self, class: &str) -> usize {
        self.pool(class).in_flight()
    }

    pub fn capacity(&self, class: &str) -> usize {
        self.pool(class).capacity()
    }
}
