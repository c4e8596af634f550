#![forbid(unsafe_code)]

//! Fan-out fetcher that races the same request against several mirrors.
//!
//! Every mirror is queried at once; the first 2xx answer with a JSON body
//! wins and the remaining requests are aborted. Individual mirror failures
//! are logged and folded into a single [`RaceFailure`] when nobody succeeds.

use std::{collections::HashMap, future::Future, io::Read, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{
    task::{Id, JoinSet},
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, info, warn};

use crate::error::{RaceFailure, UpstreamFailure};

/// Mirror bodies larger than this are cut off and will fail to parse.
const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Raw answer from a mirror, before any status or body checks.
#[derive(Debug, Clone)]
pub struct MirrorResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// A plain HTTP GET against `url`. Non-2xx statuses are returned as
/// responses, only transport problems are errors.
pub trait MirrorClient: Send + Sync + 'static {
    fn get(
        &self,
        url: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<MirrorResponse>> + Send;
}

/// Production client. `ureq` is blocking, so each request runs on the
/// blocking pool; an aborted race leaves the request to finish in the
/// background, bounded by the per-request timeout.
#[derive(Clone)]
pub struct UreqMirrorClient {
    agent: ureq::Agent,
}

impl UreqMirrorClient {
    pub fn new(user_agent: &str) -> Self {
        let agent = ureq::AgentBuilder::new().user_agent(user_agent).build();
        Self { agent }
    }
}

impl MirrorClient for UreqMirrorClient {
    fn get(
        &self,
        url: String,
        timeout: Duration,
    ) -> impl Future<Output = Result<MirrorResponse>> + Send {
        let agent = self.agent.clone();
        async move {
            tokio::task::spawn_blocking(move || fetch_blocking(&agent, &url, timeout))
                .await
                .context("mirror request task failed")?
        }
    }
}

fn fetch_blocking(agent: &ureq::Agent, url: &str, timeout: Duration) -> Result<MirrorResponse> {
    let response = match agent.get(url).timeout(timeout).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(err) => return Err(err).with_context(|| format!("requesting {url}")),
    };
    let status = response.status();
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_BODY_BYTES)
        .read_to_end(&mut body)
        .with_context(|| format!("reading body from {url}"))?;
    Ok(MirrorResponse { status, body })
}

/// The winning mirror and its parsed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceWin {
    pub mirror: String,
    pub payload: Value,
}

/// Timeouts for one race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceTimeouts {
    pub per_request: Duration,
    pub overall: Duration,
}

/// Stateless between calls: no cache, no retries, no memory of which mirror
/// was fast last time.
pub struct RaceFetcher<C> {
    client: Arc<C>,
}

impl<C> Clone for RaceFetcher<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: MirrorClient> RaceFetcher<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Requests `mirror + path` from every mirror at once and returns the
    /// first success.
    ///
    /// List order only breaks ties between answers that are already complete
    /// when the winner is picked; otherwise the fastest mirror wins.
    pub async fn race(
        &self,
        path: &str,
        mirrors: &[String],
        timeouts: RaceTimeouts,
    ) -> Result<RaceWin, RaceFailure> {
        let attempted = mirrors.len();
        let mut failures = Vec::new();
        if mirrors.is_empty() {
            return Err(RaceFailure {
                attempted,
                failures,
                deadline_elapsed: false,
            });
        }

        let deadline = Instant::now() + timeouts.overall;
        let mut tasks = JoinSet::new();
        let mut task_mirrors: HashMap<Id, String> = HashMap::with_capacity(attempted);
        for (index, base) in mirrors.iter().enumerate() {
            let client = Arc::clone(&self.client);
            let mirror = base.clone();
            let url = join_url(base, path);
            let handle = tasks.spawn(async move {
                let outcome = attempt(client.as_ref(), &mirror, url, timeouts.per_request).await;
                (index, mirror, outcome)
            });
            task_mirrors.insert(handle.id(), base.clone());
        }

        loop {
            let joined = match timeout_at(deadline, tasks.join_next_with_id()).await {
                Err(_) => {
                    warn!(
                        path,
                        attempted,
                        failed = failures.len(),
                        "mirror race deadline elapsed"
                    );
                    tasks.abort_all();
                    return Err(RaceFailure {
                        attempted,
                        failures,
                        deadline_elapsed: true,
                    });
                }
                Ok(None) => {
                    warn!(path, attempted, "every mirror failed");
                    return Err(RaceFailure {
                        attempted,
                        failures,
                        deadline_elapsed: false,
                    });
                }
                Ok(Some(joined)) => joined,
            };

            match joined {
                Ok((_, (index, mirror, Ok(payload)))) => {
                    let mut best = (index, mirror, payload);
                    while let Some(extra) = tasks.try_join_next() {
                        if let Ok((other_index, other_mirror, Ok(other_payload))) = extra
                            && other_index < best.0
                        {
                            best = (other_index, other_mirror, other_payload);
                        }
                    }
                    tasks.abort_all();
                    let (_, mirror, payload) = best;
                    info!(path, mirror = %mirror, "mirror race won");
                    return Ok(RaceWin { mirror, payload });
                }
                Ok((_, (_, _, Err(failure)))) => {
                    debug!(path, error = %failure, "mirror attempt failed");
                    failures.push(failure);
                }
                Err(err) => {
                    let mirror = task_mirrors.remove(&err.id()).unwrap_or_default();
                    let failure = UpstreamFailure::Transport {
                        mirror,
                        reason: err.to_string(),
                    };
                    debug!(path, error = %failure, "mirror task died");
                    failures.push(failure);
                }
            }
        }
    }
}

async fn attempt<C: MirrorClient>(
    client: &C,
    mirror: &str,
    url: String,
    per_request: Duration,
) -> Result<Value, UpstreamFailure> {
    let response = match timeout(per_request, client.get(url, per_request)).await {
        Err(_) => {
            return Err(UpstreamFailure::Timeout {
                mirror: mirror.to_owned(),
                after: per_request,
            });
        }
        Ok(Err(err)) => {
            return Err(UpstreamFailure::Transport {
                mirror: mirror.to_owned(),
                reason: format!("{err:#}"),
            });
        }
        Ok(Ok(response)) => response,
    };

    if !(200..300).contains(&response.status) {
        return Err(UpstreamFailure::Status {
            mirror: mirror.to_owned(),
            status: response.status,
        });
    }

    serde_json::from_slice(&response.body).map_err(|err| UpstreamFailure::InvalidBody {
        mirror: mirror.to_owned(),
        reason: err.to_string(),
    })
}

/// Joins a mirror base URL and a request path with exactly one slash.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
