#![forbid(unsafe_code)]

//! Namespace-partitioned TTL cache for extracted payloads.
//!
//! Entries are evicted lazily: `get` re-checks validity on every read and
//! `sweep` is called at the start of read-heavy operations instead of from a
//! background timer. Expired-but-unswept entries are therefore invisible to
//! readers and only show up in `snapshot`.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Independent key spaces. A key stored under one namespace is never visible
/// from another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Video,
    Playlist,
    Channel,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Video, Namespace::Playlist, Namespace::Channel];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Playlist => "playlist",
            Self::Channel => "channel",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct CacheEntry {
    payload: Value,
    stored_at: Instant,
    stored_at_wall: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    fn is_valid_at(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }

    fn stats(&self, now: Instant) -> EntryStats {
        let age = self.age(now);
        EntryStats {
            age_sec: age.as_secs(),
            remaining_sec: (self.ttl.as_secs_f64() - age.as_secs_f64()) as i64,
            total_duration: self.ttl.as_secs(),
            stored_at: self
                .stored_at_wall
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Observability view of a single entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntryStats {
    pub age_sec: u64,
    /// Negative once the entry expired but has not been swept yet.
    pub remaining_sec: i64,
    pub total_duration: u64,
    pub stored_at: String,
}

/// Per-namespace listing returned by [`TtlCache::snapshot`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheSnapshot {
    pub video_streams: BTreeMap<String, EntryStats>,
    pub playlists: BTreeMap<String, EntryStats>,
    pub channels: BTreeMap<String, EntryStats>,
}

impl CacheSnapshot {
    pub fn namespace(&self, namespace: Namespace) -> &BTreeMap<String, EntryStats> {
        match namespace {
            Namespace::Video => &self.video_streams,
            Namespace::Playlist => &self.playlists,
            Namespace::Channel => &self.channels,
        }
    }

    fn namespace_mut(&mut self, namespace: Namespace) -> &mut BTreeMap<String, EntryStats> {
        match namespace {
            Namespace::Video => &mut self.video_streams,
            Namespace::Playlist => &mut self.playlists,
            Namespace::Channel => &mut self.channels,
        }
    }
}

/// The cache store. One map per namespace, each behind its own lock so a
/// sweep of one namespace never blocks readers of another for long.
///
/// Locks are only taken for synchronous map operations and are never held
/// across an `.await`.
#[derive(Default)]
pub struct TtlCache {
    videos: RwLock<HashMap<String, CacheEntry>>,
    playlists: RwLock<HashMap<String, CacheEntry>>,
    channels: RwLock<HashMap<String, CacheEntry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, namespace: Namespace) -> &RwLock<HashMap<String, CacheEntry>> {
        match namespace {
            Namespace::Video => &self.videos,
            Namespace::Playlist => &self.playlists,
            Namespace::Channel => &self.channels,
        }
    }

    /// Returns the payload only when the entry exists and is still valid.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Value> {
        let now = Instant::now();
        self.map(namespace)
            .read()
            .get(key)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.payload.clone())
    }

    /// Stores `payload`, replacing whatever was there. The entry's clock
    /// starts now.
    pub fn put(&self, namespace: Namespace, key: impl Into<String>, payload: Value, ttl: Duration) {
        let entry = CacheEntry {
            payload,
            stored_at: Instant::now(),
            stored_at_wall: Utc::now(),
            ttl,
        };
        self.map(namespace).write().insert(key.into(), entry);
    }

    pub fn delete(&self, namespace: Namespace, key: &str) -> bool {
        self.map(namespace).write().remove(key).is_some()
    }

    /// Administrative delete: removes `key` from every namespace it appears in.
    /// Returns `false` only when no namespace held it.
    pub fn delete_everywhere(&self, key: &str) -> bool {
        Namespace::ALL
            .into_iter()
            .fold(false, |deleted, namespace| {
                self.delete(namespace, key) || deleted
            })
    }

    /// Evicts every entry whose age reached its TTL and returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        Namespace::ALL
            .into_iter()
            .map(|namespace| {
                let mut map = self.map(namespace).write();
                let before = map.len();
                map.retain(|_, entry| entry.is_valid_at(now));
                before - map.len()
            })
            .sum()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let now = Instant::now();
        let mut snapshot = CacheSnapshot::default();
        for namespace in Namespace::ALL {
            let map = self.map(namespace).read();
            let target = snapshot.namespace_mut(namespace);
            for (key, entry) in map.iter() {
                target.insert(key.clone(), entry.stats(now));
            }
        }
        snapshot
    }

    /// Physically stored entries, expired or not.
    pub fn len(&self) -> usize {
        Namespace::ALL
            .into_iter()
            .map(|namespace| self.map(namespace).read().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::advance;

    const TTL: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn get_hits_until_ttl_then_misses() {
        let cache = TtlCache::new();
        cache.put(Namespace::Video, "abc", json!({"title": "a"}), TTL);

        advance(TTL - Duration::from_millis(1)).await;
        assert_eq!(
            cache.get(Namespace::Video, "abc"),
            Some(json!({"title": "a"}))
        );

        advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(Namespace::Video, "abc"), None);
        // Expired entries stay physically present until swept.
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn put_overwrites_and_restarts_clock() {
        let cache = TtlCache::new();
        cache.put(Namespace::Video, "abc", json!(1), TTL);
        advance(Duration::from_secs(500)).await;
        cache.put(Namespace::Video, "abc", json!(2), TTL);
        advance(Duration::from_secs(500)).await;

        assert_eq!(cache.get(Namespace::Video, "abc"), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn namespaces_are_isolated() {
        let cache = TtlCache::new();
        cache.put(Namespace::Video, "abc", json!("video"), TTL);

        assert_eq!(cache.get(Namespace::Playlist, "abc"), None);
        assert_eq!(cache.get(Namespace::Channel, "abc"), None);

        cache.put(Namespace::Playlist, "abc", json!("playlist"), TTL);
        assert!(cache.delete(Namespace::Playlist, "abc"));
        assert_eq!(cache.get(Namespace::Video, "abc"), Some(json!("video")));
    }

    #[test]
    fn delete_everywhere_scans_all_namespaces() {
        let cache = TtlCache::new();
        cache.put(Namespace::Video, "xyz", json!(1), TTL);
        cache.put(Namespace::Channel, "xyz", json!(2), TTL);
        cache.put(Namespace::Playlist, "other", json!(3), TTL);

        assert!(cache.delete_everywhere("xyz"));
        assert_eq!(cache.get(Namespace::Video, "xyz"), None);
        assert_eq!(cache.get(Namespace::Channel, "xyz"), None);
        assert_eq!(cache.get(Namespace::Playlist, "other"), Some(json!(3)));

        assert!(!cache.delete_everywhere("xyz"));
        assert!(!cache.delete(Namespace::Video, "missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_exactly_the_expired_entries() {
        let cache = TtlCache::new();
        cache.put(Namespace::Video, "short", json!(1), Duration::from_secs(10));
        cache.put(Namespace::Playlist, "edge", json!(2), Duration::from_secs(20));
        cache.put(Namespace::Channel, "long", json!(3), Duration::from_secs(30));

        assert_eq!(cache.sweep(), 0);

        advance(Duration::from_secs(20)).await;
        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.sweep(), 0);

        let snapshot = cache.snapshot();
        assert!(snapshot.video_streams.is_empty());
        assert!(snapshot.playlists.is_empty());
        assert!(snapshot.channels.contains_key("long"));
        assert_eq!(cache.get(Namespace::Channel, "long"), Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_negative_remaining_without_evicting() {
        let cache = TtlCache::new();
        cache.put(Namespace::Video, "abc", json!(1), Duration::from_secs(10));
        advance(Duration::from_secs(15)).await;

        let snapshot = cache.snapshot();
        let stats = snapshot.namespace(Namespace::Video).get("abc").unwrap();
        assert_eq!(stats.age_sec, 15);
        assert_eq!(stats.remaining_sec, -5);
        assert_eq!(stats.total_duration, 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn snapshot_serializes_with_listing_names() {
        let cache = TtlCache::new();
        cache.put(Namespace::Playlist, "PL1", json!({}), TTL);
        let value = serde_json::to_value(cache.snapshot()).unwrap();
        assert!(value["playlists"]["PL1"]["total_duration"].is_u64());
        assert!(value["video_streams"].as_object().unwrap().is_empty());
        assert!(value["channels"].as_object().unwrap().is_empty());
    }
}
