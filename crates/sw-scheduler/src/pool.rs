//! Shared resource pool: active job count and CPU/memory reservation sums.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use sw_types::{ResourceBudget, WorkerResources};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

/// Current reservation totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolUsage {
    pub active: usize,
    pub cpus: f64,
    pub memory_bytes: u64,
}

/// Resource budget shared by every batch of a service. Reservations are taken
/// and released atomically under one lock.
#[derive(Debug)]
pub struct ResourcePool {
    budget: ResourceBudget,
    usage: Mutex<PoolUsage>,
    released: Notify,
}

impl ResourcePool {
    pub fn new(budget: ResourceBudget) -> Arc<Self> {
        Arc::new(Self {
            budget,
            usage: Mutex::new(PoolUsage::default()),
            released: Notify::new(),
        })
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    pub fn usage(&self) -> PoolUsage {
        *self.usage.lock()
    }

    /// Reserve `request` if it fits in what is left of the budget.
    pub fn try_reserve(self: &Arc<Self>, request: &WorkerResources) -> Option<Reservation> {
        let mut usage = self.usage.lock();
        let cpus_fit = self
            .budget
            .max_cpus
            .map_or(true, |max| usage.cpus + request.num_cpus <= max + 1e-9);
        let memory_fits = self
            .budget
            .max_memory_bytes
            .map_or(true, |max| usage.memory_bytes.saturating_add(request.memory_bytes) <= max);
        if !(cpus_fit && memory_fits) {
            debug!(requested = %request, budget = %self.budget, "admission deferred");
            return None;
        }

        usage.active += 1;
        usage.cpus += request.num_cpus;
        usage.memory_bytes += request.memory_bytes;
        Some(Reservation {
            pool: Arc::clone(self),
            resources: request.clone(),
        })
    }

    /// Resolves after some reservation is released. Create it before calling
    /// [`try_reserve`](Self::try_reserve) and `enable` it so a release between
    /// the two is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    fn release(&self, resources: &WorkerResources) {
        {
            let mut usage = self.usage.lock();
            usage.active = usage.active.saturating_sub(1);
            usage.cpus = (usage.cpus - resources.num_cpus).max(0.0);
            usage.memory_bytes = usage.memory_bytes.saturating_sub(resources.memory_bytes);
        }
        self.released.notify_waiters();
    }
}

/// A held reservation. Dropping it returns the resources to the pool.
#[derive(Debug)]
pub struct Reservation {
    pool: Arc<ResourcePool>,
    resources: WorkerResources,
}

impl Reservation {
    pub fn resources(&self) -> &WorkerResources {
        &self.resources
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.release(&self.resources);
    }
}
