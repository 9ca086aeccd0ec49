use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/chat";
pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

const ENV_WS_URL: &str = "CHATPULSE_WS_URL";
const ENV_API_URL: &str = "CHATPULSE_API_URL";
const ENV_RECONNECT_DELAY_MS: &str = "CHATPULSE_RECONNECT_DELAY_MS";
const ENV_MAX_RECONNECT_ATTEMPTS: &str = "CHATPULSE_MAX_RECONNECT_ATTEMPTS";

/// How the connection manager re-establishes a dropped link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Fixed wait between a close and the next attempt
    pub delay_ms: u64,

    /// Give up after this many consecutive failed attempts (unbounded when unset)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Whether another attempt is allowed after `failed` consecutive failures.
    pub fn allows_retry(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Realtime endpoint
    pub ws_url: String,

    /// Base URL of the request/response endpoints
    pub api_url: String,

    pub reconnect: ReconnectPolicy,

    /// Handshake timeout for a single connection attempt
    pub connect_timeout_ms: u64,

    /// Timeout for gateway requests
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist and parse. Without one, the default
    /// location (`<config dir>/chatpulse/config.toml`) is used when present,
    /// otherwise built-in defaults. Environment overrides apply last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chatpulse").join("config.toml"))
    }

    /// Apply `CHATPULSE_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_WS_URL) {
            self.ws_url = url;
        }
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_url = url;
        }
        if let Some(raw) = lookup(ENV_RECONNECT_DELAY_MS) {
            self.reconnect.delay_ms = parse_env(ENV_RECONNECT_DELAY_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_RECONNECT_ATTEMPTS) {
            self.reconnect.max_attempts = match raw.trim() {
                "" | "none" | "unbounded" => None,
                value => Some(parse_env(ENV_MAX_RECONNECT_ATTEMPTS, value)?),
            };
        }
        Ok(self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.ws_url, "ws://localhost:8000/ws/chat");
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.reconnect.delay(), Duration::from_millis(3000));
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
ws_url = "ws://analytics.internal:9000/ws/chat"

[reconnect]
max_attempts = 5
"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ws_url, "ws://analytics.internal:9000/ws/chat");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.reconnect.delay_ms, 3000);
        assert_eq!(config.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ws_url = [not toml").unwrap();

        let err = ClientConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClientConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::default()
            .with_overrides(lookup_from(&[
                ("CHATPULSE_WS_URL", "ws://example:1/ws"),
                ("CHATPULSE_API_URL", "http://example:1"),
                ("CHATPULSE_RECONNECT_DELAY_MS", "250"),
                ("CHATPULSE_MAX_RECONNECT_ATTEMPTS", "3"),
            ]))
            .unwrap();

        assert_eq!(config.ws_url, "ws://example:1/ws");
        assert_eq!(config.api_url, "http://example:1");
        assert_eq!(config.reconnect.delay_ms, 250);
        assert_eq!(config.reconnect.max_attempts, Some(3));
    }

    #[test]
    fn test_env_unbounded_attempts() {
        let config = ClientConfig {
            reconnect: ReconnectPolicy::default().with_max_attempts(5),
            ..Default::default()
        }
        .with_overrides(lookup_from(&[("CHATPULSE_MAX_RECONNECT_ATTEMPTS", "unbounded")]))
        .unwrap();
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_env_invalid_number() {
        let err = ClientConfig::default()
            .with_overrides(lookup_from(&[("CHATPULSE_RECONNECT_DELAY_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_allows_retry() {
        let unbounded = ReconnectPolicy::default();
        assert!(unbounded.allows_retry(u32::MAX - 1));

        let bounded = ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_attempts(2);
        assert!(bounded.allows_retry(0));
        assert!(bounded.allows_retry(1));
        assert!(!bounded.allows_retry(2));
    }
}
