//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};
use uuid::Uuid;

use super::identity::{ClientIdentity, LimitClass};
use crate::config::{FailurePolicy, LimiterSettings};
use crate::error::Result;
use crate::storage::{Admission, StorageManager};

/// Configuration for a rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    /// Maximum requests admitted before the client is disabled
    pub limit: u64,
    /// How long a client stays disabled once it exceeds `limit`
    pub window: Duration,
}

/// Allow/deny answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// The rate limiter that decides whether a request is admitted.
///
/// This struct is thread-safe and can be shared across multiple tasks. All
/// counter state lives in the [`StorageManager`] it was built with.
pub struct RateLimiter {
    settings: LimiterSettings,
    storage: Arc<StorageManager>,
}

impl RateLimiter {
    /// Create a rate limiter on top of an existing storage manager.
    pub fn new(settings: LimiterSettings, storage: Arc<StorageManager>) -> Self {
        Self { settings, storage }
    }

    /// Create a rate limiter with the backend selected in `settings`.
    ///
    /// The eviction worker stops when `shutdown` is cancelled.
    pub async fn connect(settings: LimiterSettings, shutdown: CancellationToken) -> Result<Self> {
        let storage = StorageManager::connect(&settings, shutdown).await?;
        Ok(Self::new(settings, storage))
    }

    /// Count a request from `client` and decide whether it is admitted.
    ///
    /// Up to `limit` requests are admitted; the next one disables the client
    /// for `window` and schedules a reset that clears its record when the
    /// window ends. Requests from a disabled client are denied without being
    /// counted.
    pub async fn check(&self, client: &ClientIdentity) -> Decision {
        let class = client.limit_class();
        let limits = self.limits_for(class);
        let key = client.storage_key(self.settings.token_scope);

        match self.storage.admit(&key, limits.limit, limits.window).await {
            Admission::Admitted { count } => {
                trace!(
                    address = %client.address(),
                    class = %class,
                    count = count,
                    limit = limits.limit,
                    "Request admitted"
                );
                Decision::Allow
            }
            Admission::Blocked { until } => {
                trace!(
                    address = %client.address(),
                    class = %class,
                    until = %until,
                    "Request rejected, client disabled"
                );
                Decision::Deny
            }
            Admission::Tripped {
                count,
                until,
                disable_id,
            } => {
                info!(
                    address = %client.address(),
                    class = %class,
                    count = count,
                    limit = limits.limit,
                    until = %until,
                    "Client disabled"
                );
                self.schedule_reset(key, client.address().to_string(), disable_id, limits.window);
                Decision::Deny
            }
            Admission::Unavailable => {
                let decision = match self.settings.on_backend_error {
                    FailurePolicy::Open => Decision::Allow,
                    FailurePolicy::Closed => Decision::Deny,
                };
                warn!(
                    address = %client.address(),
                    decision = ?decision,
                    "Counter store unavailable, applying failure policy"
                );
                decision
            }
        }
    }

    /// Clear the client's record once its disable window has elapsed.
    ///
    /// The reset is tied to `disable_id`; if the record was reset or
    /// disabled again in the meantime it is left alone.
    fn schedule_reset(&self, key: String, address: String, disable_id: Uuid, window: Duration) {
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if storage.reset_if_current(&key, disable_id).await {
                info!(address = %address, "Client enabled");
            }
        });
    }

    /// Limit and window for a class of client.
    pub fn limits_for(&self, class: LimitClass) -> LimitConfig {
        match class {
            LimitClass::Anonymous => self.settings.anonymous,
            LimitClass::Token => self.settings.token,
        }
    }

    /// Clear every counter and disable.
    ///
    /// Meant for test harnesses and operational recovery.
    pub async fn reset_all(&self) {
        self.storage.reset_all().await;
    }

    /// Current request count per stored client key.
    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.storage.list_all().await
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }
}
