#![forbid(unsafe_code)]

//! Runtime settings for the relay.
//!
//! Each value is resolved as: explicit override (CLI) > process environment >
//! `.env` file > built-in default. Unparseable numbers fall back to the
//! default instead of aborting startup.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::extract::DEFAULT_YTDLP_PROGRAM;
use crate::policy::{DEFAULT_TTL_SECS, LONG_TTL_SECS, SHORT_TTL_SECS, TtlPolicy};
use crate::pool::{DEFAULT_EXTRACT_TIMEOUT, DEFAULT_WORKERS, MAX_EXTRACT_TIMEOUT};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_NEWTUBE_PORT: u16 = 8000;
pub const DEFAULT_NEWTUBE_HOST: &str = "127.0.0.1";
pub const DEFAULT_MIRROR_TIMEOUT_MS: u64 = 4_000;
pub const DEFAULT_RACE_TIMEOUT_MS: u64 = 8_000;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    /// Mirror base URLs in priority order, trailing slashes removed.
    pub mirrors: Vec<String>,
    pub workers: usize,
    pub extract_timeout: Duration,
    pub mirror_timeout: Duration,
    pub race_timeout: Duration,
    pub ttl: TtlPolicy,
    pub ytdlp_program: PathBuf,
    pub ytdlp_proxy: Option<String>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        build_settings_with_overrides(&HashMap::new(), |_| None, RuntimeOverrides::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Replaces the configured mirror list when non-empty.
    pub mirrors: Vec<String>,
    pub workers: Option<usize>,
    pub env_path: Option<PathBuf>,
}

pub fn load_settings() -> Result<RelaySettings> {
    resolve_settings(RuntimeOverrides::default())
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<RelaySettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RelaySettings {
    build_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RelaySettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let number = |key: &str, default: u64| {
        lookup(key)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(default)
    };

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("NEWTUBE_HOST"))
        .unwrap_or_else(|| DEFAULT_NEWTUBE_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("NEWTUBE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_NEWTUBE_PORT);
    let mirrors = if overrides.mirrors.is_empty() {
        lookup("NEWTUBE_MIRRORS")
            .map(|raw| parse_mirrors(&raw))
            .unwrap_or_default()
    } else {
        normalize_mirrors(overrides.mirrors.iter().map(String::as_str))
    };
    let workers = overrides
        .workers
        .unwrap_or_else(|| number("NEWTUBE_WORKERS", DEFAULT_WORKERS as u64) as usize)
        .max(1);

    RelaySettings {
        host,
        port,
        mirrors,
        workers,
        extract_timeout: Duration::from_secs(number(
            "NEWTUBE_EXTRACT_TIMEOUT_SECS",
            DEFAULT_EXTRACT_TIMEOUT.as_secs(),
        ))
        .min(MAX_EXTRACT_TIMEOUT),
        mirror_timeout: Duration::from_millis(number(
            "NEWTUBE_MIRROR_TIMEOUT_MS",
            DEFAULT_MIRROR_TIMEOUT_MS,
        )),
        race_timeout: Duration::from_millis(number(
            "NEWTUBE_RACE_TIMEOUT_MS",
            DEFAULT_RACE_TIMEOUT_MS,
        )),
        ttl: TtlPolicy {
            short: Duration::from_secs(number("NEWTUBE_TTL_SHORT_SECS", SHORT_TTL_SECS)),
            default: Duration::from_secs(number("NEWTUBE_TTL_DEFAULT_SECS", DEFAULT_TTL_SECS)),
            long: Duration::from_secs(number("NEWTUBE_TTL_LONG_SECS", LONG_TTL_SECS)),
        },
        ytdlp_program: PathBuf::from(
            lookup("NEWTUBE_YTDLP").unwrap_or_else(|| DEFAULT_YTDLP_PROGRAM.to_string()),
        ),
        ytdlp_proxy: lookup("NEWTUBE_YTDLP_PROXY"),
    }
}

/// Splits a comma or whitespace separated mirror list.
pub fn parse_mirrors(raw: &str) -> Vec<String> {
    normalize_mirrors(raw.split(|c: char| c == ',' || c.is_whitespace()))
}

fn normalize_mirrors<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut mirrors: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim().trim_end_matches('/');
        if value.is_empty() || mirrors.iter().any(|known| known == value) {
            continue;
        }
        mirrors.push(value.to_string());
    }
    mirrors
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses `KEY=value` lines, tolerating `export`, comments and quoting. A
/// missing file is treated as empty.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value_raw.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
