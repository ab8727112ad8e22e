//! Counter store trait for abstracting in-process and external implementations.

use async_trait::async_trait;
use std::collections::HashMap;

use super::record::ClientRecord;
use crate::error::Result;

/// Trait for counter store implementations.
///
/// A backend is a passive map from client identity to [`ClientRecord`]. It
/// applies no lifecycle logic of its own; the storage manager decides what
/// to write. Every method must be safe to call concurrently.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the record for `id`, or `None` if the client has no history.
    async fn get(&self, id: &str) -> Result<Option<ClientRecord>>;

    /// Store `record` under `id`, replacing any previous value.
    async fn set(&self, id: &str, record: &ClientRecord) -> Result<()>;

    /// Remove the record for `id`. Removing an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Copy out every record this backend holds.
    ///
    /// This is the most expensive operation and is meant for the eviction
    /// sweep and observability, not the request path.
    async fn list(&self) -> Result<HashMap<String, ClientRecord>>;

    /// Drop every record.
    async fn clear(&self) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
