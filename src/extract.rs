#![forbid(unsafe_code)]

//! Metadata extraction through the `yt-dlp` command line.
//!
//! Extraction is the expensive step the cache exists to avoid. Calls should
//! only run inside the [`ExtractionPool`](crate::pool::ExtractionPool), which
//! bounds how many run at once.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    process::Command,
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::error::{FetchError, FetchResult};

pub const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";

/// Flat extraction only lists the first page of a playlist or channel.
const FLAT_PLAYLIST_ITEMS: &str = "1-50";

/// HLS manifests are only exposed to the mobile clients.
const IOS_USER_AGENT: &str =
    "com.google.ios.youtube/19.29.1 (iPhone16,2; U; CPU iOS 17_5_1 like Mac OS X;)";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractMode {
    /// Full metadata for a single video, including every format.
    Full,
    /// Entries of a playlist or channel tab without resolving each video.
    Flat,
    /// Like `Full` but impersonating the iOS app to surface HLS manifests.
    Hls,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractRequest {
    pub url: String,
    pub mode: ExtractMode,
}

impl ExtractRequest {
    pub fn new(url: impl Into<String>, mode: ExtractMode) -> Self {
        Self {
            url: url.into(),
            mode,
        }
    }
}

/// An extraction backend. Implementations should give up once `deadline`
/// has passed.
#[async_trait]
pub trait Extractor: Send + Sync + 'static {
    async fn extract(&self, request: &ExtractRequest, deadline: Instant) -> FetchResult<Value>;
}

/// Runs `yt-dlp --dump-single-json` and parses whatever it prints.
#[derive(Clone, Debug)]
pub struct YtDlpExtractor {
    program: PathBuf,
    proxy: Option<String>,
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_YTDLP_PROGRAM, None)
    }
}

impl YtDlpExtractor {
    pub fn new(program: impl Into<PathBuf>, proxy: Option<String>) -> Self {
        Self {
            program: program.into(),
            proxy,
        }
    }

    fn command_args(&self, request: &ExtractRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--dump-single-json",
            "--skip-download",
            "--no-warnings",
            "--no-progress",
            "--no-check-certificates",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        if let Some(proxy) = &self.proxy {
            args.push("--proxy".into());
            args.push(proxy.clone());
        }

        match request.mode {
            ExtractMode::Full => {
                args.extend(["--format".into(), "best".into()]);
            }
            ExtractMode::Hls => {
                args.extend(["--format".into(), "best".into()]);
                args.extend(["--user-agent".into(), IOS_USER_AGENT.into()]);
            }
            ExtractMode::Flat => {
                args.extend([
                    "--flat-playlist".into(),
                    "--playlist-items".into(),
                    FLAT_PLAYLIST_ITEMS.into(),
                    "--lazy-playlist".into(),
                ]);
            }
        }

        args.push(request.url.clone());
        args
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(&self, request: &ExtractRequest, deadline: Instant) -> FetchResult<Value> {
        let started = Instant::now();
        debug!(url = %request.url, mode = ?request.mode, "running yt-dlp");

        let mut command = Command::new(&self.program);
        command
            .args(self.command_args(request))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // Dropping the output future at the deadline kills the child.
        let output = match timeout_at(deadline, command.output()).await {
            Err(_) => return Err(FetchError::ExtractionTimeout(started.elapsed())),
            Ok(Err(err)) => {
                return Err(FetchError::Extraction(format!(
                    "launching {}: {err}",
                    self.program.display()
                )));
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let message = last_error_line(&output.stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status));
            return Err(FetchError::Extraction(message));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|err| FetchError::Extraction(format!("parsing yt-dlp output: {err}")))
    }
}

/// yt-dlp prints the actionable message last.
fn last_error_line(stderr: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Mix playlists only resolve through the watch page, optionally seeded with
/// the video the mix was started from.
pub fn playlist_url(playlist_id: &str, seed_video: Option<&str>) -> String {
    if crate::policy::is_mix_playlist(playlist_id) {
        match seed_video {
            Some(video_id) => {
                format!("https://www.youtube.com/watch?v={video_id}&list={playlist_id}")
            }
            None => format!("https://www.youtube.com/watch?list={playlist_id}"),
        }
    } else {
        format!("https://www.youtube.com/playlist?list={playlist_id}")
    }
}

fn channel_base(channel_id: &str) -> String {
    if channel_id.starts_with('@') {
        format!("https://www.youtube.com/{channel_id}")
    } else {
        format!("https://www.youtube.com/channel/{channel_id}")
    }
}

pub fn channel_videos_url(channel_id: &str) -> String {
    format!("{}/videos", channel_base(channel_id))
}

pub fn channel_shorts_url(channel_id: &str) -> String {
    format!("{}/shorts", channel_base(channel_id))
}
