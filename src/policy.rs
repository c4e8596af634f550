#![forbid(unsafe_code)]

//! TTL classification for freshly fetched payloads.
//!
//! Everything in here is pure so it can be tested without touching the
//! network. The class is decided once, at write time.

use std::time::Duration;

use serde_json::Value;

use crate::cache::Namespace;

/// Videos exposing at least this many renditions are treated as popular and
/// stable.
pub const POPULAR_FORMAT_THRESHOLD: usize = 12;

/// Auto-generated mix playlists ("Radio") share this id prefix.
pub const MIX_PLAYLIST_PREFIX: &str = "RD";

pub const DEFAULT_TTL_SECS: u64 = 600;
pub const SHORT_TTL_SECS: u64 = 7_200;
pub const LONG_TTL_SECS: u64 = 14_200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlClass {
    Short,
    Default,
    Long,
}

/// Maps each class to a concrete duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlPolicy {
    pub short: Duration,
    pub default: Duration,
    pub long: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(SHORT_TTL_SECS),
            default: Duration::from_secs(DEFAULT_TTL_SECS),
            long: Duration::from_secs(LONG_TTL_SECS),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Short => self.short,
            TtlClass::Default => self.default,
            TtlClass::Long => self.long,
        }
    }

    pub fn ttl(&self, namespace: Namespace, key: &str, payload: &Value) -> Duration {
        self.ttl_for(classify(namespace, key, payload))
    }
}

/// Picks the TTL class for a payload about to be cached under `key`.
///
/// * video: rich format lists mean a long TTL, everything else the default.
/// * playlist: mixes are personalised and churn quickly, so they get the short
///   TTL; regular playlists the long one. Only the playlist id part of the key
///   matters, a seed-video suffix does not change the class.
/// * channel: always long.
pub fn classify(namespace: Namespace, key: &str, payload: &Value) -> TtlClass {
    match namespace {
        Namespace::Video => {
            if rendition_count(payload) >= POPULAR_FORMAT_THRESHOLD {
                TtlClass::Long
            } else {
                TtlClass::Default
            }
        }
        Namespace::Playlist => {
            if is_mix_playlist(key) {
                TtlClass::Short
            } else {
                TtlClass::Long
            }
        }
        Namespace::Channel => TtlClass::Long,
    }
}

pub fn is_mix_playlist(playlist_id: &str) -> bool {
    playlist_id.starts_with(MIX_PLAYLIST_PREFIX)
}

/// Counts renditions in either the extractor's `formats` list or a mirror's
/// split `formatStreams` / `adaptiveFormats` lists.
pub fn rendition_count(payload: &Value) -> usize {
    let len = |field: &str| payload.get(field).and_then(Value::as_array).map_or(0, Vec::len);
    match payload.get("formats").and_then(Value::as_array) {
        Some(formats) => formats.len(),
        None => len("formatStreams") + len("adaptiveFormats"),
    }
}
