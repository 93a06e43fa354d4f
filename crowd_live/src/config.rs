// THEORY:
// One plain struct carries every tunable of a live session. Defaults match the
// analyzer deployment the client was built against; `from_env` lets the
// binaries override the handful of knobs operators actually change without a
// config file. A value that is present but unparsable is an error, never a
// silent fallback to the default.

use crate::core_modules::frame_sampler::{DEFAULT_JPEG_QUALITY, DEFAULT_SAMPLE_INTERVAL};
use crate::core_modules::reconciler::BufferCapacities;
use crate::error::{LiveError, Result};
use std::time::Duration;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/ws/live";
pub const ENV_PREFIX: &str = "CROWD_LIVE_";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Analyzer WebSocket endpoint.
    pub endpoint: Url,
    /// Minimum spacing between accepted samples.
    pub sample_interval: Duration,
    /// How often the session loop asks the sampler whether a sample is due.
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
    /// How long a close frame may take to flush on stop.
    pub close_timeout: Duration,
    pub jpeg_quality: u8,
    pub capacities: BufferCapacities,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            tick_interval: Duration::from_millis(16),
            connect_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            capacities: BufferCapacities::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `CROWD_LIVE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(raw) = var("ENDPOINT") {
            config = config.with_endpoint(&raw)?;
        }
        if let Some(raw) = var("SAMPLE_INTERVAL_MS") {
            config.sample_interval = Duration::from_millis(parse_positive("SAMPLE_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = var("CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(parse_positive("CONNECT_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = var("JPEG_QUALITY") {
            let quality = parse_positive("JPEG_QUALITY", &raw)?;
            if quality > 100 {
                return Err(LiveError::Config(format!(
                    "{ENV_PREFIX}JPEG_QUALITY must be between 1 and 100, got {quality}"
                )));
            }
            config.jpeg_quality = quality as u8;
        }
        Ok(config)
    }

    /// Replaces the endpoint. Only `ws` and `wss` URLs are accepted.
    pub fn with_endpoint(mut self, raw: &str) -> Result<Self> {
        let endpoint =
            Url::parse(raw).map_err(|e| LiveError::Config(format!("endpoint {raw:?}: {e}")))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(LiveError::Config(format!(
                "endpoint {raw:?} must use ws:// or wss://"
            )));
        }
        self.endpoint = endpoint;
        Ok(self)
    }
}

fn default_endpoint() -> Url {
    match Url::parse(DEFAULT_ENDPOINT) {
        Ok(url) => url,
        Err(err) => unreachable!("{DEFAULT_ENDPOINT} does not parse: {err}"),
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(LiveError::Config(format!(
            "{ENV_PREFIX}{name} must be a positive integer, got {raw:?}"
        ))),
    }
}
