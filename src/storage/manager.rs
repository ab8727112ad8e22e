//! Storage manager: the single writer of client records.
//!
//! Every read-modify-write on a record happens while holding `guard`, so
//! concurrent increments are serialized no matter which backend is active.
//! The deferred reset and each eviction delete take the same guard. Backend
//! failures are logged here and turned into neutral answers; callers never
//! see backend error details.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::Backend;
use super::eviction::spawn_eviction_worker;
use super::memory::MemoryBackend;
use super::record::ClientRecord;
use super::redis_store::RedisBackend;
use crate::config::{LimiterSettings, StorageBackend};
use crate::error::Result;

/// Outcome of counting one request against a limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Counted and within the limit.
    Admitted { count: u64 },
    /// The client is disabled; nothing was counted.
    Blocked { until: DateTime<Utc> },
    /// This request pushed the count past the limit and disabled the client.
    Tripped {
        count: u64,
        until: DateTime<Utc>,
        disable_id: Uuid,
    },
    /// The backend could not be reached.
    Unavailable,
}

/// Owns the counter backend and the eviction worker.
pub struct StorageManager {
    backend: Arc<dyn Backend>,
    guard: RwLock<()>,
    ttl: Duration,
    shutdown: CancellationToken,
    pub(super) worker: Mutex<Option<JoinHandle<()>>>,
}

impl StorageManager {
    /// Wrap `backend` and start the eviction worker.
    ///
    /// The worker sweeps every `cleanup_interval` and stops when `shutdown`
    /// (or [`StorageManager::stop`]) is cancelled. Must be called from
    /// within a tokio runtime.
    pub fn start(
        backend: Arc<dyn Backend>,
        cleanup_interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            backend,
            guard: RwLock::new(()),
            ttl,
            shutdown: shutdown.child_token(),
            worker: Mutex::new(None),
        });

        let handle = spawn_eviction_worker(
            Arc::downgrade(&manager),
            cleanup_interval,
            manager.shutdown.clone(),
        );
        *manager.worker.lock() = Some(handle);

        info!(
            backend = manager.backend.name(),
            cleanup_interval = ?cleanup_interval,
            ttl = ?ttl,
            "Storage manager started"
        );
        manager
    }

    /// Build the backend selected in `settings` and start the manager.
    pub async fn connect(settings: &LimiterSettings, shutdown: CancellationToken) -> Result<Arc<Self>> {
        let backend: Arc<dyn Backend> = match &settings.backend {
            StorageBackend::Memory => Arc::new(MemoryBackend::new()),
            StorageBackend::Redis { url, namespace } => {
                Arc::new(RedisBackend::connect(url, namespace).await?)
            }
        };
        Ok(Self::start(
            backend,
            settings.cleanup_interval,
            settings.ttl,
            shutdown,
        ))
    }

    /// Stop the eviction worker and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Eviction worker panicked");
            }
        }
    }

    /// Count one request for `id` and compare the new count to `limit` in a
    /// single critical section.
    ///
    /// A client under an active disable is reported as blocked without being
    /// counted. A disable that has already run out (its reset never fired,
    /// e.g. after a restart) is discarded and the request opens a fresh
    /// window.
    pub async fn admit(&self, id: &str, limit: u64, window: Duration) -> Admission {
        let _guard = self.guard.write().await;
        match self.admit_locked(id, limit, window).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(client = %id, backend = self.backend.name(), error = %e, "Counter store unavailable");
                Admission::Unavailable
            }
        }
    }

    async fn admit_locked(&self, id: &str, limit: u64, window: Duration) -> Result<Admission> {
        let now = Utc::now();
        let mut record = self.load_or_new(id, now).await?;

        if let Some(until) = record.disabled_until.filter(|_| record.is_disabled_at(now)) {
            return Ok(Admission::Blocked { until });
        }
        if record.has_lapsed_disable(now) {
            debug!(client = %id, "Discarding lapsed disable");
            record = ClientRecord::new(now);
        }

        let count = record.touch(now);
        if count > limit {
            let disable_id = record.disable(now, window);
            self.backend.set(id, &record).await?;
            let until = record.disabled_until.unwrap_or(now);
            return Ok(Admission::Tripped {
                count,
                until,
                disable_id,
            });
        }

        self.backend.set(id, &record).await?;
        Ok(Admission::Admitted { count })
    }

    async fn load_or_new(&self, id: &str, now: DateTime<Utc>) -> Result<ClientRecord> {
        match self.backend.get(id).await? {
            Some(record) => Ok(record),
            None => {
                debug!(client = %id, "Creating client record");
                Ok(ClientRecord::new(now))
            }
        }
    }

    /// Increment the count for `id`, creating the record if needed, and
    /// return the new count (0 if the backend failed).
    pub async fn record_request(&self, id: &str) -> u64 {
        let _guard = self.guard.write().await;
        let result = async {
            let now = Utc::now();
            let mut record = self.load_or_new(id, now).await?;
            let count = record.touch(now);
            self.backend.set(id, &record).await?;
            Ok::<_, crate::error::SentinelError>(count)
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(client = %id, error = %e, "Failed to record request");
            0
        })
    }

    /// Disable `id` for `duration`, creating the record if needed.
    ///
    /// Returns the id stamped on the disable, or `None` if the backend
    /// failed.
    pub async fn disable(&self, id: &str, duration: Duration) -> Option<Uuid> {
        let _guard = self.guard.write().await;
        let result = async {
            let now = Utc::now();
            let mut record = self.load_or_new(id, now).await?;
            let disable_id = record.disable(now, duration);
            self.backend.set(id, &record).await?;
            Ok::<_, crate::error::SentinelError>(disable_id)
        }
        .await;

        match result {
            Ok(disable_id) => Some(disable_id),
            Err(e) => {
                warn!(client = %id, error = %e, "Failed to disable client");
                None
            }
        }
    }

    /// End of the active disable for `id`, if the client is disabled now.
    pub async fn is_disabled(&self, id: &str) -> Option<DateTime<Utc>> {
        let _guard = self.guard.read().await;
        match self.backend.get(id).await {
            Ok(Some(record)) if record.is_disabled_at(Utc::now()) => record.disabled_until,
            Ok(_) => None,
            Err(e) => {
                warn!(client = %id, error = %e, "Failed to read disable state");
                None
            }
        }
    }

    /// Requests counted for `id` in its current window, 0 if unknown.
    pub async fn get_count(&self, id: &str) -> u64 {
        let _guard = self.guard.read().await;
        match self.backend.get(id).await {
            Ok(record) => record.map(|r| r.count).unwrap_or(0),
            Err(e) => {
                warn!(client = %id, error = %e, "Failed to read request count");
                0
            }
        }
    }

    /// Forget `id` entirely.
    pub async fn reset_one(&self, id: &str) {
        let _guard = self.guard.write().await;
        if let Err(e) = self.backend.delete(id).await {
            warn!(client = %id, error = %e, "Failed to reset client");
        }
    }

    /// Forget `id` only if its active disable is still the one identified
    /// by `disable_id`. Returns whether the record was removed.
    ///
    /// A reset scheduled for an older disable must not wipe a window that
    /// started after a global reset or a lapsed-disable recovery.
    pub async fn reset_if_current(&self, id: &str, disable_id: Uuid) -> bool {
        let _guard = self.guard.write().await;
        let current = match self.backend.get(id).await {
            Ok(record) => record.and_then(|r| r.disable_id),
            Err(e) => {
                warn!(client = %id, error = %e, "Failed to read client before reset");
                return false;
            }
        };
        if current != Some(disable_id) {
            debug!(client = %id, "Skipping reset for superseded disable");
            return false;
        }

        match self.backend.delete(id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(client = %id, error = %e, "Failed to reset client");
                false
            }
        }
    }

    /// Forget every client.
    pub async fn reset_all(&self) {
        let _guard = self.guard.write().await;
        match self.backend.clear().await {
            Ok(()) => info!(backend = self.backend.name(), "All client records cleared"),
            Err(e) => warn!(error = %e, "Failed to clear client records"),
        }
    }

    /// Current count per client.
    pub async fn list_all(&self) -> HashMap<String, u64> {
        let _guard = self.guard.read().await;
        match self.backend.list().await {
            Ok(records) => records
                .into_iter()
                .map(|(id, record)| (id, record.count))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list client records");
                HashMap::new()
            }
        }
    }

    /// Delete every record that is not disabled and has been idle longer
    /// than the TTL. Returns how many were removed.
    ///
    /// The listing runs without the guard so admissions are not held up by
    /// a slow enumeration. Each candidate is read again under the write
    /// guard before it is deleted, and kept if it was touched or disabled in
    /// the meantime.
    pub async fn evict_stale(&self) -> usize {
        let now = Utc::now();
        let candidates: Vec<String> = match self.backend.list().await {
            Ok(records) => records
                .into_iter()
                .filter(|(_, record)| record.is_evictable(now, self.ttl))
                .map(|(id, _)| id)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Eviction sweep could not list records");
                return 0;
            }
        };

        let mut removed = 0;
        for id in candidates {
            let _guard = self.guard.write().await;
            match self.backend.get(&id).await {
                Ok(Some(record)) if !record.is_evictable(Utc::now(), self.ttl) => {
                    debug!(client = %id, "Keeping record touched during sweep");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(client = %id, error = %e, "Failed to re-read record before eviction");
                    continue;
                }
            }
            match self.backend.delete(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(client = %id, error = %e, "Failed to evict record"),
            }
        }

        if removed > 0 {
            info!(removed = removed, "Eviction sweep complete");
        }
        removed
    }
}
