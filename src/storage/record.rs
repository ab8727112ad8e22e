//! Per-client counter record.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Counter state kept for one client identity.
///
/// A record is only ever mutated by the storage manager; backends store and
/// return copies of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// Time of the most recent increment
    pub last_seen: DateTime<Utc>,
    /// End of the active disable, if one was ever applied to this window
    #[serde(default)]
    pub disabled_until: Option<DateTime<Utc>>,
    /// Identifies the disable that set `disabled_until`
    #[serde(default)]
    pub disable_id: Option<Uuid>,
}

impl ClientRecord {
    /// A fresh record with no requests counted.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            last_seen: now,
            disabled_until: None,
            disable_id: None,
        }
    }

    /// Count one request at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>) -> u64 {
        self.count = self.count.saturating_add(1);
        self.last_seen = now;
        self.count
    }

    /// Block the client until `now + duration` and return the id stamped on
    /// this disable.
    pub fn disable(&mut self, now: DateTime<Utc>, duration: Duration) -> Uuid {
        let until = TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let id = Uuid::new_v4();
        self.disabled_until = Some(until);
        self.disable_id = Some(id);
        id
    }

    /// Whether a disable is still in effect at `now`.
    pub fn is_disabled_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.disabled_until, Some(until) if until > now)
    }

    /// Whether the record carries a disable that has already run out.
    pub fn has_lapsed_disable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.disabled_until, Some(until) if until <= now)
    }

    /// Whether the eviction sweep may drop this record.
    ///
    /// Active disables are never evictable, however old `last_seen` is.
    pub fn is_evictable(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        if self.is_disabled_at(now) {
            return false;
        }
        (now - self.last_seen)
            .to_std()
            .map(|idle| idle > ttl)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_increments() {
        let now = Utc::now();
        let mut record = ClientRecord::new(now);

        assert_eq!(record.touch(now), 1);
        assert_eq!(record.touch(now), 2);
        assert_eq!(record.count, 2);
    }

    #[test]
    fn test_disable_sets_future_deadline() {
        let now = Utc::now();
        let mut record = ClientRecord::new(now);

        let id = record.disable(now, Duration::from_secs(4));

        assert_eq!(record.disable_id, Some(id));
        assert_eq!(record.disabled_until, Some(now + TimeDelta::seconds(4)));
        assert!(record.is_disabled_at(now));
        assert!(!record.is_disabled_at(now + TimeDelta::seconds(5)));
        assert!(record.has_lapsed_disable(now + TimeDelta::seconds(4)));
    }

    #[test]
    fn test_each_disable_gets_a_new_id() {
        let now = Utc::now();
        let mut record = ClientRecord::new(now);

        let first = record.disable(now, Duration::from_secs(1));
        let second = record.disable(now, Duration::from_secs(1));
        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_record_is_evictable() {
        let now = Utc::now();
        let record = ClientRecord::new(now - TimeDelta::minutes(20));

        assert!(record.is_evictable(now, Duration::from_secs(600)));
        assert!(!record.is_evictable(now, Duration::from_secs(3600)));
    }

    #[test]
    fn test_disabled_record_is_never_evictable() {
        let now = Utc::now();
        let mut record = ClientRecord::new(now - TimeDelta::days(2));
        record.disable(now, Duration::from_secs(60));

        assert!(!record.is_evictable(now, Duration::from_secs(1)));
    }

    #[test]
    fn test_json_encoding_keeps_disable() {
        let now = Utc::now();
        let mut record = ClientRecord::new(now);
        record.touch(now);
        record.disable(now, Duration::from_secs(2));

        let json = serde_json::to_string(&record).unwrap();
        let decoded: ClientRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_json_without_disable_fields() {
        let decoded: ClientRecord =
            serde_json::from_str(r#"{"count":3,"last_seen":"2024-01-01T00:00:00Z"}"#).unwrap();

        assert_eq!(decoded.count, 3);
        assert!(decoded.disabled_until.is_none());
        assert!(decoded.disable_id.is_none());
    }
}
