//! In-process counter store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::backend::Backend;
use super::record::ClientRecord;
use crate::error::Result;

/// Counter store backed by a `HashMap` behind a read/write lock.
///
/// Reads hand out clones, so callers can never reach the stored records.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, ClientRecord>>,
}

impl MemoryBackend {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, id: &str) -> Result<Option<ClientRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn set(&self, id: &str, record: &ClientRecord) -> Result<()> {
        self.records.write().insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, ClientRecord>> {
        Ok(self.records.read().clone())
    }

    async fn clear(&self) -> Result<()> {
        self.records.write().clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;
    use std::time::Duration;

    fn record(count: u64) -> ClientRecord {
        let mut record = ClientRecord::new(Utc::now());
        record.count = count;
        record
    }

    #[tokio::test]
    async fn test_new_backend_is_empty() {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty());
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = MemoryBackend::new();
        backend.set("192.168.1.1", &record(5)).await.unwrap();

        let stored = backend.get("192.168.1.1").await.unwrap().unwrap();
        assert_eq!(stored.count, 5);
    }

    #[tokio::test]
    async fn test_set_replaces_previous_value() {
        let backend = MemoryBackend::new();
        backend.set("192.168.1.1", &record(5)).await.unwrap();
        backend.set("192.168.1.1", &record(10)).await.unwrap();

        assert_eq!(backend.get("192.168.1.1").await.unwrap().unwrap().count, 10);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let backend = MemoryBackend::new();
        assert!(backend.get("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.set("192.168.1.1", &record(1)).await.unwrap();

        backend.delete("192.168.1.1").await.unwrap();
        backend.delete("192.168.1.1").await.unwrap();
        backend.delete("never-seen").await.unwrap();

        assert!(backend.get("192.168.1.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disable_deadline_is_stored() {
        let backend = MemoryBackend::new();
        let mut data = record(5);
        data.disable(Utc::now(), Duration::from_secs(3600));
        backend.set("192.168.1.1", &data).await.unwrap();

        let stored = backend.get("192.168.1.1").await.unwrap().unwrap();
        assert_eq!(stored.disabled_until, data.disabled_until);
        assert_eq!(stored.disable_id, data.disable_id);
    }

    #[tokio::test]
    async fn test_list_returns_independent_copies() {
        let backend = MemoryBackend::new();
        backend.set("192.168.1.1", &record(5)).await.unwrap();
        backend.set("192.168.1.2", &record(10)).await.unwrap();

        let mut listed = backend.list().await.unwrap();
        assert_eq!(listed.len(), 2);

        listed.get_mut("192.168.1.1").unwrap().count = 999;
        listed.get_mut("192.168.1.2").unwrap().last_seen -= TimeDelta::days(1);

        assert_eq!(backend.get("192.168.1.1").await.unwrap().unwrap().count, 5);
        let fresh = backend.list().await.unwrap();
        assert!(fresh["192.168.1.2"].last_seen > Utc::now() - TimeDelta::hours(1));
    }

    #[tokio::test]
    async fn test_get_returns_copy() {
        let backend = MemoryBackend::new();
        backend.set("192.168.1.1", &record(5)).await.unwrap();

        let mut copy = backend.get("192.168.1.1").await.unwrap().unwrap();
        copy.count = 42;

        assert_eq!(backend.get("192.168.1.1").await.unwrap().unwrap().count, 5);
    }

    #[tokio::test]
    async fn test_clear() {
        let backend = MemoryBackend::new();
        for i in 0..3 {
            backend.set(&format!("10.0.0.{}", i), &record(i)).await.unwrap();
        }

        backend.clear().await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_access() {
        let backend = Arc::new(MemoryBackend::new());
        let mut handles = Vec::new();

        for i in 0..100u64 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                let id = format!("192.168.1.{}", i % 16);
                backend.set(&id, &record(i)).await.unwrap();
                backend.get(&id).await.unwrap();
                if i % 2 == 0 {
                    backend.delete(&id).await.unwrap();
                }
                backend.list().await.unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(backend.len() <= 16);
    }
}
