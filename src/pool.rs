//! Admission & thread-pool layer (spec §4.4).
//!
//! Named pools, each with a bounded concurrency and a bounded waiting
//! queue. Modeled the way the teacher models a bounded shared resource in
//! `src/lock_map.rs`: an owned guard whose `Drop` releases the slot, backed
//! here by a `tokio::sync::Semaphore` rather than a per-key mutex, since the
//! resource is "N concurrent admissions" rather than "one lock per key".

use crate::config::PoolConfig;
use crate::error::{NodeError, Result};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A single named pool: `size` concurrent permits, `queue` additional
/// FIFO waiters tracked independently so admission can be rejected once
/// both are saturated (spec §4.4).
struct Pool {
    semaphore: Arc<Semaphore>,
    size: usize,
    queue_capacity: usize,
    waiting: Arc<tokio::sync::Mutex<usize>>,
}

impl Pool {
    fn new(size: usize, queue_capacity: usize) -> Self {
        Pool {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            queue_capacity,
            waiting: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    fn free(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn waiting(&self) -> usize {
        *self.waiting.lock().await
    }

    /// Admission decision of spec §4.4: accept immediately if a slot is
    /// free; else enqueue (and block for a slot) if under the queue cap;
    /// else reject with `SlotUnavailable`.
    async fn try_admit(&self) -> Result<PoolPermit> {
        if self.free() > 0 {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| NodeError::internal(e))?;
            return Ok(PoolPermit { _permit: permit });
        }

        let mut waiting = self.waiting.lock().await;
        if *waiting >= self.queue_capacity {
            return Err(NodeError::SlotUnavailable);
        }
        *waiting += 1;
        drop(waiting);

        let permit = self.semaphore.clone().acquire_owned().await;

        let mut waiting = self.waiting.lock().await;
        *waiting = waiting.saturating_sub(1);
        drop(waiting);

        let permit = permit.map_err(|e| NodeError::internal(e))?;
        Ok(PoolPermit { _permit: permit })
    }
}

/// Holds a pool slot; dropping it releases the slot back to the pool, the
/// same RAII shape as the teacher's `LockMapGuard`.
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// The process-wide set of named pools, built once from configuration.
pub struct PoolRegistry {
    pools: HashMap<String, Pool>,
}

impl PoolRegistry {
    pub fn new(configs: &[PoolConfig]) -> Result<Self> {
        if !configs.iter().any(|c| c.name() == crate::config::DEFAULT_POOL) {
            return Err(NodeError::internal(format!(
                "pool {:?} must exist",
                crate::config::DEFAULT_POOL
            )));
        }
        let pools = configs
            .iter()
            .map(|c| (c.name().to_string(), Pool::new(c.size(), c.queue())))
            .collect();
        Ok(PoolRegistry { pools })
    }

    /// Admits a request into `pool_name` (defaulting callers should pass
    /// `"default"` when the `x-zerovm-pool` header is absent, per spec §4.4).
    pub async fn admit(&self, pool_name: &str) -> Result<PoolPermit> {
        let pool = self
            .pools
            .get(pool_name)
            .ok_or_else(|| NodeError::BadRequest(format!("unknown pool {:?}", pool_name)))?;
        pool.try_admit().await
    }

    pub fn free(&self, pool_name: &str) -> Option<usize> {
        self.pools.get(pool_name).map(Pool::free)
    }

    pub async fn waiting(&self, pool_name: &str) -> Option<usize> {
        match self.pools.get(pool_name) {
            Some(p) => Some(p.waiting().await),
            None => None,
        }
    }

    pub fn size(&self, pool_name: &str) -> Option<usize> {
        self.pools.get(pool_name).map(|p| p.size)
    }
}
