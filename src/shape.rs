#![forbid(unsafe_code)]

//! Turns raw `yt-dlp` JSON into the compact payloads served to clients.
//!
//! The raw structs only name the fields we read; everything else in the
//! extractor output is ignored. yt-dlp leaves many fields null or out
//! entirely, so every input field is optional.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    resolution: Option<String>,
    url: Option<String>,
    protocol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntry {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    thumbnails: Option<Vec<RawThumbnail>>,
    view_count: Option<i64>,
    duration: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    subscriber_count: Option<i64>,
    channel_follower_count: Option<i64>,
    hls_url: Option<String>,
    #[serde(default)]
    formats: Option<Vec<RawFormat>>,
    #[serde(default)]
    thumbnails: Option<Vec<RawThumbnail>>,
    #[serde(default)]
    entries: Option<Vec<Option<RawEntry>>>,
}

impl RawInfo {
    fn parse(info: &Value) -> Self {
        // A malformed field should degrade to "missing", not fail the request.
        serde_json::from_value(info.clone()).unwrap_or_default()
    }

    fn formats(&self) -> impl Iterator<Item = &RawFormat> {
        self.formats.iter().flatten()
    }

    fn entries(&self) -> impl Iterator<Item = &RawEntry> {
        self.entries.iter().flatten().flatten()
    }

    fn display_name(&self) -> Option<String> {
        self.uploader.clone().or_else(|| self.channel.clone())
    }
}

fn best_thumbnail(thumbnails: Option<&[RawThumbnail]>) -> Option<String> {
    thumbnails?.last()?.url.clone()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFormat {
    pub itag: Option<String>,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamPayload {
    pub title: Option<String>,
    pub id: String,
    pub formats: Vec<StreamFormat>,
}

/// Directly playable formats. MHTML storyboards and formats without a URL are
/// dropped.
pub fn stream_payload(video_id: &str, info: &Value) -> StreamPayload {
    let raw = RawInfo::parse(info);
    let formats = raw
        .formats()
        .filter(|format| format.ext.as_deref() != Some("mhtml"))
        .filter_map(|format| {
            let url = format.url.clone().filter(|url| !url.is_empty())?;
            Some(StreamFormat {
                itag: format.format_id.clone(),
                ext: format.ext.clone(),
                resolution: format.resolution.clone(),
                url,
            })
        })
        .collect();
    StreamPayload {
        title: raw.title,
        id: video_id.to_owned(),
        formats,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HlsStream {
    pub url: String,
    pub resolution: Option<String>,
    pub protocol: Option<String>,
    pub ext: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HlsPayload {
    pub title: Option<String>,
    pub video_id: String,
    pub m3u8_streams: Vec<HlsStream>,
}

/// HLS variants, falling back to the top-level adaptive manifest when no
/// individual variant is listed.
pub fn hls_payload(video_id: &str, info: &Value) -> HlsPayload {
    let raw = RawInfo::parse(info);
    let mut streams: Vec<HlsStream> = raw
        .formats()
        .filter_map(|format| {
            let url = format.url.as_deref()?;
            let is_hls =
                format.protocol.as_deref() == Some("m3u8_native") || url.contains(".m3u8");
            is_hls.then(|| HlsStream {
                url: url.to_owned(),
                resolution: format.resolution.clone(),
                protocol: format.protocol.clone(),
                ext: format.ext.clone(),
            })
        })
        .collect();

    if streams.is_empty()
        && let Some(url) = raw.hls_url.clone()
    {
        streams.push(HlsStream {
            url,
            resolution: Some("adaptive".into()),
            protocol: Some("m3u8_native".into()),
            ext: Some("m3u8".into()),
        });
    }

    HlsPayload {
        title: raw.title,
        video_id: video_id.to_owned(),
        m3u8_streams: streams,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistPayload {
    pub id: String,
    pub title: Option<String>,
    pub video_count: usize,
    pub entries: Vec<PlaylistEntry>,
}

pub fn playlist_payload(playlist_id: &str, info: &Value) -> PlaylistPayload {
    let raw = RawInfo::parse(info);
    let entries: Vec<PlaylistEntry> = raw
        .entries()
        .map(|entry| PlaylistEntry {
            id: entry.id.clone(),
            title: entry.title.clone(),
            thumbnail: best_thumbnail(entry.thumbnails.as_deref()),
        })
        .collect();
    PlaylistPayload {
        id: playlist_id.to_owned(),
        title: raw.title,
        video_count: entries.len(),
        entries,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelVideo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub view_count: Option<i64>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelPayload {
    pub channel_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub subscriber_count: Option<i64>,
    pub avatar: Option<String>,
    pub banner: Option<String>,
    pub videos: Vec<ChannelVideo>,
}

/// Channel header plus the first page of uploads. yt-dlp lists the avatar
/// first and the banner last among the channel thumbnails.
pub fn channel_payload(info: &Value) -> ChannelPayload {
    let raw = RawInfo::parse(info);
    let thumbnails = raw.thumbnails.as_deref().unwrap_or_default();
    let videos = raw
        .entries()
        .map(|entry| ChannelVideo {
            id: entry.id.clone(),
            title: entry.title.clone(),
            view_count: entry.view_count,
            thumbnail: best_thumbnail(entry.thumbnails.as_deref()),
            duration: entry.duration,
        })
        .collect();
    ChannelPayload {
        channel_id: raw.id.clone(),
        name: raw.display_name(),
        description: raw.description.clone(),
        subscriber_count: raw.subscriber_count.or(raw.channel_follower_count),
        avatar: thumbnails.first().and_then(|thumb| thumb.url.clone()),
        banner: thumbnails.last().and_then(|thumb| thumb.url.clone()),
        videos,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShortEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub view_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShortsPayload {
    pub channel_id: Option<String>,
    pub name: Option<String>,
    pub shorts: Vec<ShortEntry>,
}

pub fn shorts_payload(info: &Value) -> ShortsPayload {
    let raw = RawInfo::parse(info);
    let shorts = raw
        .entries()
        .map(|entry| ShortEntry {
            id: entry.id.clone(),
            title: entry.title.clone(),
            thumbnail: best_thumbnail(entry.thumbnails.as_deref()),
            view_count: entry.view_count,
        })
        .collect();
    ShortsPayload {
        channel_id: raw.id.clone(),
        name: raw.display_name(),
        shorts,
    }
}
