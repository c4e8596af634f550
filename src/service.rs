#![forbid(unsafe_code)]

//! Cache-first fetch orchestration.
//!
//! Every cached lookup follows the same path: sweep expired entries, try the
//! cache, and on a miss fetch (extraction pool or mirror race), classify,
//! store and return. The processing registry shows the key while the fetch
//! is outstanding. Failures are returned as-is and never cached.
//!
//! Concurrent misses for the same key are serialized through a per-key gate;
//! the second caller re-checks the cache after the first one finished
//! instead of fetching again.

use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheSnapshot, Namespace, TtlCache},
    config::RelaySettings,
    error::{FetchError, FetchResult},
    extract::{
        ExtractMode, ExtractRequest, Extractor, channel_shorts_url, channel_videos_url,
        playlist_url, watch_url,
    },
    policy::{TtlPolicy, is_mix_playlist},
    pool::ExtractionPool,
    processing::ProcessingRegistry,
    race::{MirrorClient, RaceFetcher, RaceTimeouts},
    shape,
};

type FlightKey = (Namespace, String);
type FlightMap = Mutex<HashMap<FlightKey, Flight>>;

/// Gate for one key plus the number of callers currently holding a ticket.
struct Flight {
    gate: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

/// Payload of the `/status` endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessingStatus {
    pub processing_count: usize,
    pub processing_ids: Vec<String>,
}

pub fn playlist_cache_key(playlist_id: &str, seed_video: Option<&str>) -> String {
    match seed_video {
        Some(seed) if is_mix_playlist(playlist_id) => format!("{playlist_id}_{seed}"),
        _ => playlist_id.to_owned(),
    }
}

pub fn shorts_cache_key(channel_id: &str) -> String {
    format!("shorts_{channel_id}")
}

pub fn mirror_video_key(video_id: &str) -> String {
    format!("mirror:{video_id}")
}

pub fn mirror_video_path(video_id: &str) -> String {
    format!("/api/v1/videos/{video_id}")
}

/// Video ids are spliced into upstream URLs, so only the YouTube id alphabet
/// is accepted.
pub fn is_valid_video_id(video_id: &str) -> bool {
    !video_id.is_empty()
        && video_id.len() <= 64
        && video_id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
}

fn check_video_id(video_id: &str) -> FetchResult<()> {
    if is_valid_video_id(video_id) {
        Ok(())
    } else {
        Err(FetchError::InvalidId(video_id.to_owned()))
    }
}

pub struct RelayService<C> {
    cache: Arc<TtlCache>,
    processing: Arc<ProcessingRegistry>,
    pool: ExtractionPool,
    extractor: Arc<dyn Extractor>,
    race: RaceFetcher<C>,
    mirrors: Vec<String>,
    race_timeouts: RaceTimeouts,
    ttl: TtlPolicy,
    flights: FlightMap,
}

impl<C: MirrorClient> RelayService<C> {
    pub fn new(settings: &RelaySettings, extractor: Arc<dyn Extractor>, client: C) -> Self {
        Self {
            cache: Arc::new(TtlCache::new()),
            processing: Arc::new(ProcessingRegistry::new()),
            pool: ExtractionPool::new(settings.workers, settings.extract_timeout),
            extractor,
            race: RaceFetcher::new(client),
            mirrors: settings.mirrors.clone(),
            race_timeouts: RaceTimeouts {
                per_request: settings.mirror_timeout,
                overall: settings.race_timeout,
            },
            ttl: settings.ttl,
            flights: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &TtlCache {
        &self.cache
    }

    pub fn processing(&self) -> &ProcessingRegistry {
        &self.processing
    }

    pub fn pool(&self) -> &ExtractionPool {
        &self.pool
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    pub async fn stream(&self, video_id: &str) -> FetchResult<Value> {
        check_video_id(video_id)?;
        self.cached(Namespace::Video, video_id.to_owned(), || async move {
            let info = self
                .extract(ExtractRequest::new(watch_url(video_id), ExtractMode::Full))
                .await?;
            to_payload(shape::stream_payload(video_id, &info))
        })
        .await
    }

    /// Manifest URLs expire quickly upstream, so HLS lookups bypass the cache.
    pub async fn hls(&self, video_id: &str) -> FetchResult<Value> {
        check_video_id(video_id)?;
        let _processing = self.processing.track(video_id);
        let info = self
            .extract(ExtractRequest::new(watch_url(video_id), ExtractMode::Hls))
            .await?;
        to_payload(shape::hls_payload(video_id, &info))
    }

    pub async fn playlist(&self, playlist_id: &str, seed_video: Option<&str>) -> FetchResult<Value> {
        let key = playlist_cache_key(playlist_id, seed_video);
        self.cached(Namespace::Playlist, key, || async move {
            let url = playlist_url(playlist_id, seed_video);
            let info = self
                .extract(ExtractRequest::new(url, ExtractMode::Flat))
                .await?;
            to_payload(shape::playlist_payload(playlist_id, &info))
        })
        .await
    }

    pub async fn channel(&self, channel_id: &str) -> FetchResult<Value> {
        self.cached(Namespace::Channel, channel_id.to_owned(), || async move {
            let info = self
                .extract(ExtractRequest::new(
                    channel_videos_url(channel_id),
                    ExtractMode::Flat,
                ))
                .await?;
            to_payload(shape::channel_payload(&info))
        })
        .await
    }

    pub async fn shorts(&self, channel_id: &str) -> FetchResult<Value> {
        self.cached(Namespace::Channel, shorts_cache_key(channel_id), || async move {
            let info = self
                .extract(ExtractRequest::new(
                    channel_shorts_url(channel_id),
                    ExtractMode::Flat,
                ))
                .await?;
            to_payload(shape::shorts_payload(&info))
        })
        .await
    }

    /// Video metadata from whichever configured mirror answers first.
    pub async fn mirror_video(&self, video_id: &str) -> FetchResult<Value> {
        check_video_id(video_id)?;
        self.cached(Namespace::Video, mirror_video_key(video_id), || async move {
            if self.mirrors.is_empty() {
                return Err(FetchError::NoMirrors);
            }
            let win = self
                .race
                .race(&mirror_video_path(video_id), &self.mirrors, self.race_timeouts)
                .await?;
            Ok(win.payload)
        })
        .await
    }

    pub fn status(&self) -> ProcessingStatus {
        ProcessingStatus {
            processing_count: self.processing.count(),
            processing_ids: self.processing.list(),
        }
    }

    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    /// Drops `id` from every namespace.
    pub fn delete_cached(&self, id: &str) -> FetchResult<()> {
        if self.cache.delete_everywhere(id) {
            info!(id, "cache entry deleted");
            Ok(())
        } else {
            Err(FetchError::NotFound(id.to_owned()))
        }
    }

    async fn extract(&self, request: ExtractRequest) -> FetchResult<Value> {
        self.pool
            .run(|deadline| async move { self.extractor.extract(&request, deadline).await })
            .await
    }

    async fn cached<F, Fut>(&self, namespace: Namespace, key: String, fetch: F) -> FetchResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<Value>>,
    {
        let swept = self.cache.sweep();
        if swept > 0 {
            debug!(swept, "evicted expired cache entries");
        }
        if let Some(hit) = self.cache.get(namespace, &key) {
            debug!(%namespace, key, "cache hit");
            return Ok(hit);
        }

        let ticket = FlightTicket::join(&self.flights, namespace, &key);
        let _turn = ticket.gate.lock().await;
        if let Some(hit) = self.cache.get(namespace, &key) {
            debug!(%namespace, key, "filled by concurrent fetch");
            return Ok(hit);
        }

        info!(%namespace, key, "cache miss, fetching");
        let _processing = self.processing.track(key.as_str());
        match fetch().await {
            Ok(payload) => {
                let ttl = self.ttl.ttl(namespace, &key, &payload);
                self.cache.put(namespace, key.as_str(), payload.clone(), ttl);
                debug!(%namespace, key, ttl_secs = ttl.as_secs(), "cached");
                Ok(payload)
            }
            Err(err) => {
                warn!(%namespace, key, error = %err, "fetch failed");
                Err(err)
            }
        }
    }
}

/// Membership in the per-key gate map. The map entry is removed when the
/// last interested caller drops its ticket, including cancelled ones.
struct FlightTicket<'a> {
    flights: &'a FlightMap,
    key: FlightKey,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> FlightTicket<'a> {
    fn join(flights: &'a FlightMap, namespace: Namespace, key: &str) -> Self {
        let key = (namespace, key.to_owned());
        let mut map = flights.lock();
        let flight = map.entry(key.clone()).or_insert_with(|| Flight {
            gate: Arc::default(),
            holders: 0,
        });
        flight.holders += 1;
        let gate = Arc::clone(&flight.gate);
        drop(map);
        Self { flights, key, gate }
    }
}

impl Drop for FlightTicket<'_> {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get_mut(&self.key) {
            flight.holders = flight.holders.saturating_sub(1);
            if flight.holders == 0 {
                flights.remove(&self.key);
            }
        }
    }
}

fn to_payload(payload: impl Serialize) -> FetchResult<Value> {
    serde_json::to_value(payload)
        .map_err(|err| FetchError::Extraction(format!("encoding payload: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::race::MirrorResponse;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use serde_json::json;
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };
    use tokio::{sync::Notify, time::Instant};

    /// Returns canned `yt-dlp` JSON per URL and counts calls.
    #[derive(Default)]
    struct FakeExtractor {
        responses: HashMap<String, Value>,
        calls: AtomicUsize,
        delay: Duration,
        gate: Option<Arc<Notify>>,
    }

    impl FakeExtractor {
        fn with(mut self, url: String, info: Value) -> Self {
            self.responses.insert(url, info);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(&self, request: &ExtractRequest, _deadline: Instant) -> FetchResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.delay).await;
            self.responses
                .get(&request.url)
                .cloned()
                .ok_or_else(|| FetchError::Extraction(format!("ERROR: unavailable {}", request.url)))
        }
    }

    #[derive(Default)]
    struct StaticMirrors {
        routes: HashMap<String, (u16, String)>,
    }

    impl MirrorClient for StaticMirrors {
        fn get(
            &self,
            url: String,
            _timeout: Duration,
        ) -> impl Future<Output = Result<MirrorResponse>> + Send {
            let route = self.routes.get(&url).cloned();
            async move {
                let Some((status, body)) = route else {
                    bail!("connection refused");
                };
                Ok(MirrorResponse {
                    status,
                    body: body.into_bytes(),
                })
            }
        }
    }

    fn formats(count: usize) -> Value {
        let formats: Vec<Value> = (0..count)
            .map(|i| json!({"format_id": i.to_string(), "ext": "mp4", "url": format!("https://cdn.test/{i}")}))
            .collect();
        json!({"title": "Video", "formats": formats})
    }

    fn service(extractor: FakeExtractor) -> (RelayService<StaticMirrors>, Arc<FakeExtractor>) {
        service_with(extractor, RelaySettings::default(), StaticMirrors::default())
    }

    fn service_with(
        extractor: FakeExtractor,
        settings: RelaySettings,
        mirrors: StaticMirrors,
    ) -> (RelayService<StaticMirrors>, Arc<FakeExtractor>) {
        let extractor = Arc::new(extractor);
        let relay = RelayService::new(&settings, extractor.clone(), mirrors);
        (relay, extractor)
    }

    #[tokio::test]
    async fn stream_is_fetched_once_then_served_from_cache() {
        let (relay, extractor) =
            service(FakeExtractor::default().with(watch_url("pop"), formats(15)));

        let first = relay.stream("pop").await.unwrap();
        let second = relay.stream("pop").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first["formats"].as_array().unwrap().len(), 15);
        assert_eq!(extractor.calls(), 1);

        let snapshot = relay.cache_snapshot();
        let stats = &snapshot.video_streams["pop"];
        assert_eq!(stats.total_duration, relay.ttl.long.as_secs());
        assert!(relay.status().processing_ids.is_empty());
    }

    #[tokio::test]
    async fn sparse_stream_gets_default_ttl() {
        let (relay, _) = service(FakeExtractor::default().with(watch_url("rare"), formats(3)));
        relay.stream("rare").await.unwrap();
        let snapshot = relay.cache_snapshot();
        assert_eq!(
            snapshot.video_streams["rare"].total_duration,
            relay.ttl.default.as_secs()
        );
    }

    #[tokio::test]
    async fn failures_are_not_cached_and_unregister() {
        let (relay, extractor) = service(FakeExtractor::default());

        let err = relay.stream("gone").await.unwrap_err();
        assert!(matches!(err, FetchError::Extraction(_)));
        assert!(relay.cache().is_empty());
        assert_eq!(relay.status().processing_count, 0);

        relay.stream("gone").await.unwrap_err();
        assert_eq!(extractor.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_refetched() {
        let (relay, extractor) =
            service(FakeExtractor::default().with(watch_url("v"), formats(2)));
        relay.stream("v").await.unwrap();
        relay.stream("v").await.unwrap();
        assert_eq!(extractor.calls(), 1);

        tokio::time::advance(relay.ttl.default).await;
        relay.stream("v").await.unwrap();
        assert_eq!(extractor.calls(), 2);
        assert_eq!(relay.cache().len(), 1);
    }

    #[tokio::test]
    async fn mix_playlists_key_on_seed_and_expire_sooner() {
        let info = json!({"title": "Mix", "entries": [{"id": "a"}, null, {"id": "b"}]});
        let (relay, _) = service(
            FakeExtractor::default()
                .with(playlist_url("RDabc", Some("seed")), info.clone())
                .with(playlist_url("PLabc", None), info),
        );

        let mix = relay.playlist("RDabc", Some("seed")).await.unwrap();
        assert_eq!(mix["video_count"], 2);
        relay.playlist("PLabc", Some("ignored")).await.unwrap();

        let snapshot = relay.cache_snapshot();
        assert_eq!(
            snapshot.playlists["RDabc_seed"].total_duration,
            relay.ttl.short.as_secs()
        );
        assert_eq!(
            snapshot.playlists["PLabc"].total_duration,
            relay.ttl.long.as_secs()
        );
    }

    #[tokio::test]
    async fn channel_and_shorts_share_namespace_under_distinct_keys() {
        let info = json!({"id": "UC1", "uploader": "Chan", "entries": [{"id": "s"}]});
        let (relay, _) = service(
            FakeExtractor::default()
                .with(channel_videos_url("UC1"), info.clone())
                .with(channel_shorts_url("UC1"), info),
        );

        relay.channel("UC1").await.unwrap();
        let shorts = relay.shorts("UC1").await.unwrap();
        assert_eq!(shorts["name"], "Chan");

        let snapshot = relay.cache_snapshot();
        assert!(snapshot.channels.contains_key("UC1"));
        assert!(snapshot.channels.contains_key("shorts_UC1"));

        relay.delete_cached("shorts_UC1").unwrap();
        assert!(matches!(
            relay.delete_cached("shorts_UC1"),
            Err(FetchError::NotFound(_))
        ));
        assert!(relay.cache().get(Namespace::Channel, "UC1").is_some());
    }

    #[tokio::test]
    async fn hls_lookups_bypass_the_cache() {
        let info = json!({"title": "Live", "hls_url": "https://cdn.test/master.m3u8"});
        let (relay, extractor) =
            service(FakeExtractor::default().with(watch_url("live"), info));

        relay.hls("live").await.unwrap();
        let payload = relay.hls("live").await.unwrap();
        assert_eq!(payload["m3u8_streams"][0]["resolution"], "adaptive");
        assert_eq!(extractor.calls(), 2);
        assert!(relay.cache().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_misses_share_one_fetch() {
        let extractor = FakeExtractor {
            delay: Duration::from_millis(50),
            ..FakeExtractor::default()
        }
        .with(watch_url("hot"), formats(4));
        let (relay, extractor) = service(extractor);

        let (a, b) = tokio::join!(relay.stream("hot"), relay.stream("hot"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(extractor.calls(), 1);
        assert!(relay.flights.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processing_registry_shows_outstanding_fetch() {
        let release = Arc::new(Notify::new());
        let extractor = FakeExtractor {
            gate: Some(release.clone()),
            ..FakeExtractor::default()
        }
        .with(playlist_url("PLslow", None), json!({"entries": []}));
        let (relay, _) = service(extractor);
        let relay = Arc::new(relay);

        let task_relay = relay.clone();
        let pending = tokio::spawn(async move { task_relay.playlist("PLslow", None).await });

        let mut seen = false;
        for _ in 0..200 {
            if relay.status().processing_ids == vec!["PLslow".to_string()] {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen, "fetch never showed up in the registry");

        release.notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(relay.status().processing_count, 0);
    }

    #[tokio::test]
    async fn mirror_video_races_configured_mirrors() {
        let settings = RelaySettings {
            mirrors: vec!["https://down.test".into(), "https://up.test".into()],
            ..RelaySettings::default()
        };
        let mut mirrors = StaticMirrors::default();
        mirrors.routes.insert(
            "https://up.test/api/v1/videos/vid".into(),
            (200, r#"{"title":"From mirror","formatStreams":[{}]}"#.into()),
        );
        let (relay, extractor) = service_with(FakeExtractor::default(), settings, mirrors);

        let payload = relay.mirror_video("vid").await.unwrap();
        assert_eq!(payload["title"], "From mirror");
        assert_eq!(extractor.calls(), 0);
        assert!(relay.cache().get(Namespace::Video, "mirror:vid").is_some());
        assert!(relay.cache().get(Namespace::Video, "vid").is_none());
    }

    #[tokio::test]
    async fn mirror_failures_surface_as_aggregate_and_are_not_cached() {
        let settings = RelaySettings {
            mirrors: vec!["https://a.test".into(), "https://b.test".into()],
            ..RelaySettings::default()
        };
        let mut mirrors = StaticMirrors::default();
        mirrors
            .routes
            .insert("https://a.test/api/v1/videos/vid".into(), (502, String::new()));
        let (relay, _) = service_with(FakeExtractor::default(), settings, mirrors);

        match relay.mirror_video("vid").await {
            Err(FetchError::Mirrors(failure)) => {
                assert_eq!(failure.attempted, 2);
                assert_eq!(failure.failures.len(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(relay.cache().is_empty());
    }

    #[tokio::test]
    async fn mirror_video_without_mirrors_fails() {
        let (relay, _) = service(FakeExtractor::default());
        assert!(matches!(
            relay.mirror_video("vid").await,
            Err(FetchError::NoMirrors)
        ));
    }

    #[tokio::test]
    async fn malformed_video_ids_never_reach_upstreams() {
        let settings = RelaySettings {
            mirrors: vec!["https://a.test".into()],
            ..RelaySettings::default()
        };
        let (relay, extractor) =
            service_with(FakeExtractor::default(), settings, StaticMirrors::default());

        for id in ["../../admin", "abc?x=1", "abc/def", "", "a b"] {
            assert!(matches!(
                relay.mirror_video(id).await,
                Err(FetchError::InvalidId(_))
            ));
            assert!(matches!(relay.stream(id).await, Err(FetchError::InvalidId(_))));
            assert!(matches!(relay.hls(id).await, Err(FetchError::InvalidId(_))));
        }
        assert_eq!(extractor.calls(), 0);
        assert!(relay.cache().is_empty());
        assert_eq!(relay.status().processing_count, 0);
    }

    #[test]
    fn video_id_alphabet() {
        assert!(is_valid_video_id("dQw4w9WgXcQ"));
        assert!(is_valid_video_id("a-b_c"));
        assert!(!is_valid_video_id("a%2Fb"));
        assert!(!is_valid_video_id(&"x".repeat(65)));
    }

    #[test]
    fn flight_entry_outlives_all_but_the_last_ticket() {
        let flights: FlightMap = Mutex::new(HashMap::new());
        let first = FlightTicket::join(&flights, Namespace::Video, "k");
        let second = FlightTicket::join(&flights, Namespace::Video, "k");
        assert!(Arc::ptr_eq(&first.gate, &second.gate));

        drop(first);
        assert_eq!(flights.lock().len(), 1);
        drop(second);
        assert!(flights.lock().is_empty());
    }

    #[test]
    fn simultaneous_ticket_drops_leave_no_stale_gate() {
        let flights: FlightMap = Mutex::new(HashMap::new());
        for _ in 0..200 {
            let barrier = Barrier::new(4);
            thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        let ticket = FlightTicket::join(&flights, Namespace::Playlist, "PLx");
                        barrier.wait();
                        drop(ticket);
                    });
                }
            });
            assert!(flights.lock().is_empty());
        }
    }

    #[test]
    fn cache_keys_follow_resource_kind() {
        assert_eq!(playlist_cache_key("RDx", Some("v")), "RDx_v");
        assert_eq!(playlist_cache_key("RDx", None), "RDx");
        assert_eq!(playlist_cache_key("PLx", Some("v")), "PLx");
        assert_eq!(shorts_cache_key("@h"), "shorts_@h");
        assert_eq!(mirror_video_key("abc"), "mirror:abc");
    }
}
