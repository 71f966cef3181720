use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::{ApiError, ConnectionError};

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/";
const DEFAULT_PUSH_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_FRAMES_URL: &str = "ws://127.0.0.1:8000/ws/screencast";

/// Runtime configuration for the live sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST API used for polling (always ends with `/`).
    pub api_base_url: String,
    /// Websocket endpoint of the push channel.
    pub push_url: String,
    /// Websocket prefix of the per-session screencast channel.
    pub frames_url: String,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Reconnect attempts before the connection gives up. `0` retries forever.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Ceiling after which a busy indicator clears itself.
    pub watchdog_ceiling: Duration,
    /// Step budget each persona is configured with.
    pub max_steps: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            push_url: DEFAULT_PUSH_URL.to_string(),
            frames_url: DEFAULT_FRAMES_URL.to_string(),
            poll_interval: Duration::from_millis(3_000),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_millis(30_000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_millis(25_000),
            watchdog_ceiling: Duration::from_millis(15_000),
            max_steps: 30,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `STUDY_WATCH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| -> Duration {
            parse_number(key, lookup(key), fallback.as_millis() as u64)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            api_base_url: lookup("STUDY_WATCH_API_URL")
                .map(|raw| normalize_http_base(&raw))
                .unwrap_or(defaults.api_base_url),
            push_url: lookup("STUDY_WATCH_PUSH_URL").unwrap_or(defaults.push_url),
            frames_url: lookup("STUDY_WATCH_FRAMES_URL").unwrap_or(defaults.frames_url),
            poll_interval: millis("STUDY_WATCH_POLL_MS", defaults.poll_interval),
            backoff_initial: millis("STUDY_WATCH_BACKOFF_INITIAL_MS", defaults.backoff_initial),
            backoff_max: millis("STUDY_WATCH_BACKOFF_MAX_MS", defaults.backoff_max),
            max_reconnect_attempts: parse_number(
                "STUDY_WATCH_MAX_RECONNECTS",
                lookup("STUDY_WATCH_MAX_RECONNECTS"),
                u64::from(defaults.max_reconnect_attempts),
            )
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(defaults.max_reconnect_attempts),
            heartbeat_interval: millis("STUDY_WATCH_HEARTBEAT_MS", defaults.heartbeat_interval),
            watchdog_ceiling: millis("STUDY_WATCH_WATCHDOG_MS", defaults.watchdog_ceiling),
            max_steps: parse_number(
                "STUDY_WATCH_MAX_STEPS",
                lookup("STUDY_WATCH_MAX_STEPS"),
                u64::from(defaults.max_steps),
            )
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(defaults.max_steps),
        }
    }

    /// Parsed API base, ready for relative endpoint joins.
    pub fn api_base(&self) -> Result<Url, ApiError> {
        Url::parse(&normalize_http_base(&self.api_base_url))
            .map_err(|err| ApiError::InvalidConfig(format!("invalid api base url: {err}")))
    }

    pub fn push_endpoint(&self) -> Result<Url, ConnectionError> {
        Url::parse(self.push_url.trim())
            .map_err(|err| ConnectionError::Dial(format!("invalid push url {}: {err}", self.push_url)))
    }
}

fn parse_number(key: &str, raw: Option<String>, fallback: u64) -> Option<u64> {
    let raw = raw?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target = "config", key, value = %raw, error = %err, "ignoring invalid numeric setting");
            Some(fallback)
        }
    }
}

/// Adds a scheme when missing and guarantees a trailing slash.
pub fn normalize_http_base(raw: &str) -> String {
    let mut base = raw.trim().to_string();
    if !base.starts_with("http://") && !base.starts_with("https://") {
        base = format!("http://{base}");
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.api_base_url, "http://127.0.0.1:8000/api/");
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.max_steps, 30);
    }

    #[test]
    fn lookup_overrides_and_normalizes() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("STUDY_WATCH_API_URL", "studies.example.com/api"),
            ("STUDY_WATCH_POLL_MS", "1500"),
            ("STUDY_WATCH_MAX_STEPS", "12"),
        ]));
        assert_eq!(config.api_base_url, "http://studies.example.com/api/");
        assert_eq!(config.poll_interval, Duration::from_millis(1500));
        assert_eq!(config.max_steps, 12);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("STUDY_WATCH_BACKOFF_MAX_MS", "soon"),
            ("STUDY_WATCH_MAX_RECONNECTS", "-3"),
        ]));
        assert_eq!(config.backoff_max, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 10);
    }

    #[test]
    fn from_env_reads_process_environment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let original = env::var("STUDY_WATCH_PUSH_URL").ok();

        unsafe {
            env::set_var("STUDY_WATCH_PUSH_URL", "wss://push.example.com/ws");
        }
        let config = SyncConfig::from_env();
        assert_eq!(config.push_url, "wss://push.example.com/ws");

        unsafe {
            if let Some(orig) = original {
                env::set_var("STUDY_WATCH_PUSH_URL", orig);
            } else {
                env::remove_var("STUDY_WATCH_PUSH_URL");
            }
        }
    }
}
