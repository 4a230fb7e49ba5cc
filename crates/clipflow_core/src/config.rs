//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Runtime configuration for the rendering service.
///
/// Every field has a conservative default and a `CLIPFLOW_*` environment
/// override; the encode timeout and concurrency limits are deliberately
/// configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// TCP port the HTTP facade listens on.
    pub port: u16,

    /// Root directory under which per-job workspaces are created.
    pub workdir: PathBuf,

    /// Retry budget per asset fetch, not counting the first attempt.
    pub fetch_retries: u32,

    /// Per-attempt asset fetch timeout, in seconds.
    pub fetch_timeout_secs: u64,

    /// Maximum in-flight asset fetches per job.
    pub fetch_concurrency: usize,

    /// Maximum jobs encoding at the same time.
    pub max_concurrent_jobs: usize,

    /// Hard limit on a single encode run, in seconds. Zero disables it.
    pub encode_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 6108,
            workdir: PathBuf::from("render_jobs"),
            fetch_retries: 3,
            fetch_timeout_secs: 30,
            fetch_concurrency: 4,
            max_concurrent_jobs: 2,
            encode_timeout_secs: 0,
        }
    }
}

impl ServiceConfig {
    /// Build a config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("CLIPFLOW_PORT", defaults.port),
            workdir: std::env::var("CLIPFLOW_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workdir),
            fetch_retries: env_or("CLIPFLOW_FETCH_RETRIES", defaults.fetch_retries),
            fetch_timeout_secs: env_or("CLIPFLOW_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            fetch_concurrency: env_or("CLIPFLOW_FETCH_CONCURRENCY", defaults.fetch_concurrency),
            max_concurrent_jobs: env_or("CLIPFLOW_MAX_JOBS", defaults.max_concurrent_jobs),
            encode_timeout_secs: env_or(
                "CLIPFLOW_ENCODE_TIMEOUT_SECS",
                defaults.encode_timeout_secs,
            ),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("ignoring unparseable {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
