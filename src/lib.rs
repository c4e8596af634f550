#![forbid(unsafe_code)]

//! Resilient fetch layer for the NewTube relay.
//!
//! Lookups go through a TTL cache in front of two upstream kinds: a bounded
//! pool of `yt-dlp` extractions and a first-success race across mirror
//! instances. Everything here is transport agnostic; the HTTP surface lives in
//! the binary.

pub mod cache;
pub mod config;
pub mod error;
pub mod extract;
pub mod policy;
pub mod pool;
pub mod processing;
pub mod race;
pub mod service;
pub mod shape;
