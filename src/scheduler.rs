//! Box scheduler - bounded pool of sandbox boxes
//!
//! The scheduler owns a fixed range of box ids. A job acquires an exclusive
//! `BoxLease` for its duration; callers beyond capacity wait in the
//! semaphore queue (or fail fast with `try_acquire`). Every lease gives its
//! box back exactly once: explicitly through `release`, or from `Drop` when
//! the job panicked or its future was cancelled. A box whose cleanup fails or
//! hangs past the grace period is retired instead of being handed to the
//! next tenant.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, warn};

use crate::error::{EvalError, Result};
use crate::sandbox::{Sandbox, SandboxFactory};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// First box id of this scheduler's range
    pub first_box_id: u32,
    /// Number of boxes (maximum concurrent jobs)
    pub num_boxes: u32,
    /// Memory ceiling in KB for jobs that do not override it
    pub default_memory_kb: u64,
    /// How long `acquire` waits for a free box (None waits forever)
    pub acquire_timeout: Option<Duration>,
    /// How long a box may take to clean up before it is retired
    pub release_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            first_box_id: 0,
            num_boxes: 4,
            default_memory_kb: 256 * 1024,
            acquire_timeout: None,
            release_grace: Duration::from_secs(5),
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    factory: Arc<dyn SandboxFactory>,
    permits: Arc<Semaphore>,
    free_ids: Mutex<Vec<u32>>,
    retired: AtomicU32,
    submitted: AtomicU64,
}

impl Inner {
    fn push_free(&self, box_id: u32) {
        match self.free_ids.lock() {
            Ok(mut ids) => ids.push(box_id),
            Err(poisoned) => poisoned.into_inner().push(box_id),
        }
    }

    fn pop_free(&self) -> Option<u32> {
        match self.free_ids.lock() {
            Ok(mut ids) => ids.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }
    }
}

/// Bounded pool of sandbox boxes
#[derive(Clone)]
pub struct BoxScheduler {
    inner: Arc<Inner>,
}

impl BoxScheduler {
    pub fn new(config: SchedulerConfig, factory: Arc<dyn SandboxFactory>) -> Self {
        let ids = (config.first_box_id..config.first_box_id + config.num_boxes)
            .rev()
            .collect();
        let permits = Arc::new(Semaphore::new(config.num_boxes as usize));
        if config.num_boxes == 0 {
            permits.close();
        }

        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                permits,
                free_ids: Mutex::new(ids),
                retired: AtomicU32::new(0),
                submitted: AtomicU64::new(0),
            }),
        }
    }

    /// Memory ceiling for a job: 0 means the scheduler default
    pub fn resolve_memory_limit(&self, memory_limit_kb: u64) -> u64 {
        if memory_limit_kb == 0 {
            self.inner.config.default_memory_kb
        } else {
            memory_limit_kb
        }
    }

    pub fn default_memory_limit_kb(&self) -> u64 {
        self.inner.config.default_memory_kb
    }

    /// Acquire a box, waiting for one to become free
    pub async fn acquire(&self, memory_limit_kb: u64) -> Result<BoxLease> {
        let semaphore = self.inner.permits.clone();
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, semaphore.acquire_owned())
                .await
                .map_err(|_| EvalError::SchedulerExhausted(limit))?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| EvalError::SchedulerClosed)?;

        self.open_box(permit, memory_limit_kb).await
    }

    /// Acquire a box only if one is free right now
    pub async fn try_acquire(&self, memory_limit_kb: u64) -> Result<BoxLease> {
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => EvalError::SchedulerClosed,
                TryAcquireError::NoPermits => EvalError::SchedulerExhausted(Duration::ZERO),
            })?;

        self.open_box(permit, memory_limit_kb).await
    }

    async fn open_box(&self, permit: OwnedSemaphorePermit, memory_limit_kb: u64) -> Result<BoxLease> {
        let box_id = self.inner.pop_free().ok_or_else(|| {
            EvalError::Sandbox("box permit granted without a free box id".into())
        })?;
        // From here on the slot returns the id on every exit path
        let slot = Slot {
            inner: self.inner.clone(),
            box_id,
            permit: Some(permit),
        };

        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        let sandbox = self.inner.factory.create(box_id).await?;
        debug!(box_id, "Acquired box");

        Ok(BoxLease {
            slot: Some(slot),
            sandbox: Some(sandbox),
            memory_limit_kb: self.resolve_memory_limit(memory_limit_kb),
            healthy: true,
            release_grace: self.inner.config.release_grace,
        })
    }

    /// Boxes free right now
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Boxes still in service
    pub fn capacity(&self) -> u32 {
        self.inner.config.num_boxes - self.retired()
    }

    /// Boxes taken out of service
    pub fn retired(&self) -> u32 {
        self.inner.retired.load(Ordering::Relaxed)
    }

    /// Jobs that were handed a box since startup
    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Refuse new acquisitions; jobs already holding a box finish normally
    pub fn shutdown(&self) {
        self.inner.permits.close();
    }
}

/// Ownership of one box id plus its semaphore permit
struct Slot {
    inner: Arc<Inner>,
    box_id: u32,
    permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    fn retire(mut self) {
        if let Some(permit) = self.permit.take() {
            permit.forget();
        }
        let retired = self.inner.retired.fetch_add(1, Ordering::Relaxed) + 1;
        error!(box_id = self.box_id, "Box retired from service");
        if retired >= self.inner.config.num_boxes {
            error!("Every box has been retired, shutting the scheduler down");
            self.inner.permits.close();
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            // Id first, so whoever the permit wakes finds it
            self.inner.push_free(self.box_id);
            drop(permit);
        }
    }
}

/// Exclusive handle to one box for the duration of a job
pub struct BoxLease {
    slot: Option<Slot>,
    sandbox: Option<Arc<dyn Sandbox>>,
    memory_limit_kb: u64,
    healthy: bool,
    release_grace: Duration,
}

impl BoxLease {
    pub fn box_id(&self) -> u32 {
        self.slot.as_ref().map(|s| s.box_id).unwrap_or_default()
    }

    /// Memory ceiling in KB applied to this job
    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_kb
    }

    pub fn sandbox(&self) -> Result<Arc<dyn Sandbox>> {
        self.sandbox
            .clone()
            .ok_or_else(|| EvalError::Sandbox("lease already released".into()))
    }

    /// The box can no longer be trusted and must not serve another tenant
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    /// Clean the box and return it to the pool
    pub async fn release(mut self) {
        if let (Some(slot), Some(sandbox)) = (self.slot.take(), self.sandbox.take()) {
            release_slot(slot, sandbox, self.healthy, self.release_grace).await;
        }
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        let (Some(slot), Some(sandbox)) = (self.slot.take(), self.sandbox.take()) else {
            return;
        };

        warn!(box_id = slot.box_id, "Box lease dropped without release, cleaning up in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_slot(slot, sandbox, self.healthy, self.release_grace));
            }
            Err(_) => slot.retire(),
        }
    }
}

async fn release_slot(slot: Slot, sandbox: Arc<dyn Sandbox>, healthy: bool, grace: Duration) {
    let cleaned = tokio::time::timeout(grace, sandbox.cleanup()).await;

    if !healthy {
        slot.retire();
        return;
    }

    match cleaned {
        Ok(Ok(())) => {
            debug!(box_id = slot.box_id, "Released box");
            drop(slot);
        }
        Ok(Err(e)) => {
            warn!(box_id = slot.box_id, "Box cleanup failed: {}", e);
            slot.retire();
        }
        Err(_) => {
            warn!(box_id = slot.box_id, "Box cleanup exceeded {:?}", grace);
            slot.retire();
        }
    }
}
