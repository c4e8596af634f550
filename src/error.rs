#![forbid(unsafe_code)]

//! Error types shared by the fetch layer.
//!
//! Per-attempt failures (`UpstreamFailure`) never escape the race fetcher on
//! their own; callers only ever see the aggregate (`RaceFailure`) or a
//! `FetchError`.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Why a single mirror attempt did not produce a usable payload.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamFailure {
    #[error("{mirror} answered with status {status}")]
    Status { mirror: String, status: u16 },

    #[error("{mirror} transport error: {reason}")]
    Transport { mirror: String, reason: String },

    #[error("{mirror} timed out after {after:?}")]
    Timeout { mirror: String, after: Duration },

    #[error("{mirror} returned an unparseable body: {reason}")]
    InvalidBody { mirror: String, reason: String },
}

impl UpstreamFailure {
    pub fn mirror(&self) -> &str {
        match self {
            Self::Status { mirror, .. }
            | Self::Transport { mirror, .. }
            | Self::Timeout { mirror, .. }
            | Self::InvalidBody { mirror, .. } => mirror,
        }
    }
}

/// Every mirror in a race failed, or the overall deadline passed first.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub struct RaceFailure {
    pub attempted: usize,
    pub failures: Vec<UpstreamFailure>,
    pub deadline_elapsed: bool,
}

impl fmt::Display for RaceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.deadline_elapsed {
            write!(
                f,
                "no mirror answered before the race deadline ({} of {} failed)",
                self.failures.len(),
                self.attempted
            )
        } else {
            write!(f, "all {} mirrors failed", self.attempted)
        }
    }
}

/// Outcome of a fetch that produced no payload. Nothing is cached for these.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("extraction timed out after {0:?}")]
    ExtractionTimeout(Duration),

    #[error("extraction worker stopped unexpectedly: {0}")]
    WorkerLost(String),

    #[error(transparent)]
    Mirrors(#[from] RaceFailure),

    #[error("no mirrors configured")]
    NoMirrors,

    #[error("no cache entry for {0}")]
    NotFound(String),

    #[error("invalid video id {0:?}")]
    InvalidId(String),
}

pub type FetchResult<T> = Result<T, FetchError>;
