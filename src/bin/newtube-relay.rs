#![forbid(unsafe_code)]

//! HTTP front of the relay.
//!
//! Every route is a thin wrapper around `RelayService`; caching, mirror
//! racing and the extraction pool all live in the library.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use clap::Parser;
use newtube_relay::{
    cache::CacheSnapshot,
    config::{RuntimeOverrides, resolve_settings},
    error::FetchError,
    extract::YtDlpExtractor,
    race::{MirrorClient, UreqMirrorClient},
    service::{ProcessingStatus, RelayService},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "newtube_relay=info,tower_http=warn";
const MIRROR_USER_AGENT: &str = concat!("newtube-relay/", env!("CARGO_PKG_VERSION"));

/// Caching relay in front of yt-dlp and mirror instances.
#[derive(Debug, Parser)]
#[command(name = "newtube-relay", version, about, long_about = None)]
struct Args {
    /// Address to listen on (overrides NEWTUBE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides NEWTUBE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Env file to read settings from
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Mirror base URL; repeat for several (replaces NEWTUBE_MIRRORS)
    #[arg(long = "mirror", value_name = "URL")]
    mirrors: Vec<String>,

    /// Concurrent extraction limit (overrides NEWTUBE_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
}

impl Args {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            mirrors: self.mirrors,
            workers: self.workers,
            env_path: self.env_file,
        }
    }
}

struct AppState<C> {
    relay: Arc<RelayService<C>>,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            relay: Arc::clone(&self.relay),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let message = err.to_string();
        match err {
            FetchError::NotFound(_) => Self::not_found(message),
            FetchError::InvalidId(_) => Self::with_status(StatusCode::BAD_REQUEST, message),
            FetchError::Mirrors(_) => Self::with_status(StatusCode::BAD_GATEWAY, message),
            FetchError::NoMirrors => Self::with_status(StatusCode::SERVICE_UNAVAILABLE, message),
            FetchError::ExtractionTimeout(_) => {
                Self::with_status(StatusCode::GATEWAY_TIMEOUT, message)
            }
            FetchError::Extraction(_) | FetchError::WorkerLost(_) => Self::internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, error = %self.message, "request failed");
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct DeleteResponse {
    status: &'static str,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct PlaylistQuery {
    v: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = resolve_settings(args.into_overrides())?;
    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", settings.host))?;

    let extractor = YtDlpExtractor::new(
        settings.ytdlp_program.clone(),
        settings.ytdlp_proxy.clone(),
    );
    let relay = RelayService::new(
        &settings,
        Arc::new(extractor),
        UreqMirrorClient::new(MIRROR_USER_AGENT),
    );
    info!(
        mirrors = settings.mirrors.len(),
        workers = relay.pool().workers(),
        extract_timeout = ?settings.extract_timeout,
        "relay configured"
    );

    let app = router(AppState {
        relay: Arc::new(relay),
    });

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("relay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running relay server")?;

    info!("relay stopped");
    Ok(())
}

fn router<C: MirrorClient>(state: AppState<C>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status::<C>))
        .route("/api/2/cache", get(get_cache::<C>))
        .route("/api/2/cache/{id}", delete(delete_cache_entry::<C>))
        .route("/stream/{video_id}", get(get_stream::<C>))
        .route("/m3u8/{video_id}", get(get_hls::<C>))
        .route("/playlist/{playlist_id}", get(get_playlist::<C>))
        .route("/short/{channel_id}", get(get_shorts::<C>))
        .route("/channel/{channel_id}", get(get_channel::<C>))
        .route("/mirror/videos/{video_id}", get(get_mirror_video::<C>))
        .fallback(|| async { ApiError::not_found("endpoint not found") })
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    // Shutdown still happens on Ctrl+C, just not gracefully.
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to install Ctrl+C handler: {}", err);
    }
}

async fn get_status<C: MirrorClient>(State(state): State<AppState<C>>) -> Json<ProcessingStatus> {
    Json(state.relay.status())
}

async fn get_cache<C: MirrorClient>(State(state): State<AppState<C>>) -> Json<CacheSnapshot> {
    Json(state.relay.cache_snapshot())
}

async fn delete_cache_entry<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DeleteResponse>> {
    state.relay.delete_cached(&id)?;
    Ok(Json(DeleteResponse {
        status: "success",
        message: format!("cache entry {id} deleted"),
    }))
}

async fn get_stream<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.relay.stream(&video_id).await?))
}

async fn get_hls<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.relay.hls(&video_id).await?))
}

async fn get_playlist<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(playlist_id): AxumPath<String>,
    Query(query): Query<PlaylistQuery>,
) -> ApiResult<Json<Value>> {
    let seed = query.v.as_deref().filter(|seed| !seed.is_empty());
    Ok(Json(state.relay.playlist(&playlist_id, seed).await?))
}

async fn get_shorts<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(channel_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.relay.shorts(&channel_id).await?))
}

async fn get_channel<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(channel_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.relay.channel(&channel_id).await?))
}

async fn get_mirror_video<C: MirrorClient>(
    State(state): State<AppState<C>>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.relay.mirror_video(&video_id).await?))
}
