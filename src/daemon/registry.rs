//! The resident daemon's in-process executor registry (spec §4.7).
//!
//! Grounded on the teacher's `src/lock_map.rs`: a registry guarded by a
//! plain `std::sync::Mutex` handing out shared state keyed by an
//! application key, generalized here from "one mutex per key" to "one
//! tracked executor per `(job, node)`" since the daemon needs to find,
//! update, and cancel a specific running executor rather than merely
//! serialize access to it.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks one in-flight `SPAWN`/`RUN` invocation: its accumulated stats
/// (the most recent complete five-line group, per §4.7) and a handle that
/// lets `STOP` cancel it.
pub struct ExecutorRecord {
    job: String,
    node: String,
    stats: Mutex<Vec<u8>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorRecord {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn stats(&self) -> Vec<u8> {
        self.stats.lock().await.clone()
    }

    pub async fn set_stats(&self, stats: Vec<u8>) {
        *self.stats.lock().await = stats;
    }

    /// Aborts the backing task, dropping its `Child` (which is spawned
    /// with `kill_on_drop(true)`) and so killing the subprocess, matching
    /// `ZerovmExecutor.stop`'s terminate-then-kill behavior.
    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}

type Key = (String, String);

/// Live executors, keyed by `(job, node)`. Selector matching against this
/// registry is exact equality, not the original's substring match (see
/// DESIGN.md).
#[derive(Default)]
pub struct Registry {
    executors: Mutex<HashMap<Key, Arc<ExecutorRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: &str, node: &str, handle: JoinHandle<()>) -> Arc<ExecutorRecord> {
        let record = Arc::new(ExecutorRecord {
            job: job.to_string(),
            node: node.to_string(),
            stats: Mutex::new(Vec::new()),
            handle: Mutex::new(Some(handle)),
        });
        self.executors
            .lock()
            .await
            .insert((job.to_string(), node.to_string()), record.clone());
        record
    }

    pub async fn remove(&self, job: &str, node: &str) {
        self.executors
            .lock()
            .await
            .remove(&(job.to_string(), node.to_string()));
    }

    pub async fn get(&self, job: &str, node: &str) -> Option<Arc<ExecutorRecord>> {
        self.executors
            .lock()
            .await
            .get(&(job.to_string(), node.to_string()))
            .cloned()
    }

    /// Executors matching `job` and, if given, `node`.
    pub async fn find(&self, job: &str, node: Option<&str>) -> Vec<Arc<ExecutorRecord>> {
        self.executors
            .lock()
            .await
            .values()
            .filter(|rec| rec.job == job && node.map_or(true, |n| rec.node == n))
            .cloned()
            .collect()
    }
}
