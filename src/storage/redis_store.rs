//! External counter store on a Redis-compatible server.
//!
//! Records are stored as JSON strings under `"{namespace}:{client}"`.
//! Enumeration uses `SCAN` restricted to the namespace so the limiter never
//! reads or deletes keys that belong to someone else, and never issues a
//! blocking `KEYS`.
//!
//! A value that no longer decodes is treated as absent by `get`, so the next
//! write replaces it, and is listed as an empty record idle since the epoch,
//! so the eviction sweep deletes it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::backend::Backend;
use super::record::ClientRecord;
use crate::error::{Result, SentinelError};

/// Keys fetched per `SCAN` round trip.
const SCAN_BATCH: usize = 256;

/// Counter store backed by Redis.
pub struct RedisBackend {
    connection_manager: ConnectionManager,
    namespace: String,
}

impl RedisBackend {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            SentinelError::Backend(format!("invalid redis url {:?}: {}", url, e))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(url = %url, error = %e, "Failed to connect to redis");
            SentinelError::Backend(format!("failed to connect to {}: {}", url, e))
        })?;

        let mut conn = connection_manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;

        debug!(url = %url, namespace = %namespace, "Connected to redis counter store");

        Ok(Self {
            connection_manager,
            namespace: namespace.to_string(),
        })
    }

    /// The key prefix this backend owns.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Collect every key under the namespace.
    async fn scan_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.connection_manager.clone();
        let pattern = scan_pattern(&self.namespace);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may report a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, id: &str) -> Result<Option<ClientRecord>> {
        let mut conn = self.connection_manager.clone();
        let key = record_key(&self.namespace, id);
        let value: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await?;

        Ok(value.and_then(|json| decode_record(&key, &json)))
    }

    async fn set(&self, id: &str, record: &ClientRecord) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        let json = serde_json::to_string(record)?;

        redis::cmd("SET")
            .arg(record_key(&self.namespace, id))
            .arg(json)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.connection_manager.clone();
        redis::cmd("DEL")
            .arg(record_key(&self.namespace, id))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, ClientRecord>> {
        let keys = self.scan_keys().await?;
        let mut records = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(records);
        }

        let mut conn = self.connection_manager.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut conn)
                .await?;

            for (key, value) in chunk.iter().zip(values) {
                // Deleted between SCAN and MGET.
                let Some(json) = value else { continue };
                let Some(id) = client_id(&self.namespace, key) else { continue };
                let record = decode_record(key, &json).unwrap_or_else(undecodable_placeholder);
                records.insert(id.to_string(), record);
            }
        }

        Ok(records)
    }

    async fn clear(&self) -> Result<()> {
        let keys = self.scan_keys().await?;
        let mut conn = self.connection_manager.clone();
        for chunk in keys.chunks(SCAN_BATCH) {
            redis::cmd("DEL")
                .arg(chunk)
                .query_async::<i64>(&mut conn)
                .await?;
        }
        debug!(namespace = %self.namespace, removed = keys.len(), "Cleared redis counter store");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Decode a stored value, or `None` if it is not a valid record.
fn decode_record(key: &str, json: &str) -> Option<ClientRecord> {
    match serde_json::from_str(json) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(key = %key, error = %e, "Undecodable counter record");
            None
        }
    }
}

/// What an undecodable value is listed as: nothing counted, long idle.
fn undecodable_placeholder() -> ClientRecord {
    ClientRecord::new(DateTime::<Utc>::UNIX_EPOCH)
}

/// Storage key for a client.
fn record_key(namespace: &str, id: &str) -> String {
    format!("{}:{}", namespace, id)
}

/// Client identity encoded in a storage key, if the key is in `namespace`.
fn client_id<'a>(namespace: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(namespace)?.strip_prefix(':')
}

/// `SCAN MATCH` pattern covering every key in `namespace`.
fn scan_pattern(namespace: &str) -> String {
    let mut pattern = String::with_capacity(namespace.len() + 2);
    for c in namespace.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(":*");
    pattern
}
