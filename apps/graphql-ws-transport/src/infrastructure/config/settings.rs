//! Client Configuration Settings
//!
//! Configuration for the subscription transport, built programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! | Variable                                 | Default |
//! |------------------------------------------|---------|
//! | `GRAPHQL_WS_URL`                         | required |
//! | `GRAPHQL_WS_CONNECTION_PARAMS`           | none (JSON object) |
//! | `GRAPHQL_WS_CONNECT_TIMEOUT_MS`          | 10000 |
//! | `GRAPHQL_WS_KEEPALIVE_INTERVAL_SECS`     | 20 |
//! | `GRAPHQL_WS_KEEPALIVE_TIMEOUT_SECS`      | 30 |
//! | `GRAPHQL_WS_RECONNECT_DELAY_INITIAL_MS`  | 500 |
//! | `GRAPHQL_WS_RECONNECT_DELAY_MAX_SECS`    | 10 |
//! | `GRAPHQL_WS_RECONNECT_DELAY_MULTIPLIER`  | 2.0 |
//! | `GRAPHQL_WS_MAX_RECONNECT_ATTEMPTS`      | 5 (0 = unlimited) |

use std::time::Duration;

use serde_json::Value;

/// Socket timing and reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    /// Bound on one connection attempt (upgrade plus handshake).
    pub connect_timeout: Duration,
    /// Interval between client pings.
    pub keepalive_interval: Duration,
    /// Silence tolerated while a ping is outstanding.
    pub keepalive_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(30),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(10),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 5,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    url: String,
    /// Payload of `connection_init`.
    pub connection_params: Option<Value>,
    /// Socket timing and reconnection settings.
    pub transport: TransportSettings,
}

impl ClientConfig {
    /// Create configuration for an endpoint with default settings.
    ///
    /// `http://` and `https://` endpoints are mapped to `ws://` and `wss://`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` for any other scheme or a missing
    /// host.
    pub fn new(url: impl AsRef<str>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: normalize_url(url.as_ref())?,
            connection_params: None,
            transport: TransportSettings::default(),
        })
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `GRAPHQL_WS_URL` is missing, empty or invalid, or
    /// `GRAPHQL_WS_CONNECTION_PARAMS` is not a JSON object.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("GRAPHQL_WS_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("GRAPHQL_WS_URL".to_string()))?;

        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("GRAPHQL_WS_URL".to_string()));
        }

        let mut config = Self::new(url.trim())?;

        if let Some(raw) = lookup("GRAPHQL_WS_CONNECTION_PARAMS").filter(|v| !v.trim().is_empty())
        {
            let params: Value = serde_json::from_str(&raw).map_err(|e| {
                ConfigError::InvalidValue("GRAPHQL_WS_CONNECTION_PARAMS".to_string(), e.to_string())
            })?;
            if !params.is_object() {
                return Err(ConfigError::InvalidValue(
                    "GRAPHQL_WS_CONNECTION_PARAMS".to_string(),
                    "expected a JSON object".to_string(),
                ));
            }
            config.connection_params = Some(params);
        }

        let defaults = TransportSettings::default();
        config.transport = TransportSettings {
            connect_timeout: parse_duration_millis(
                &lookup,
                "GRAPHQL_WS_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            ),
            keepalive_interval: parse_duration_secs(
                &lookup,
                "GRAPHQL_WS_KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval,
            ),
            keepalive_timeout: parse_duration_secs(
                &lookup,
                "GRAPHQL_WS_KEEPALIVE_TIMEOUT_SECS",
                defaults.keepalive_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "GRAPHQL_WS_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "GRAPHQL_WS_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "GRAPHQL_WS_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "GRAPHQL_WS_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        };

        Ok(config)
    }

    /// WebSocket endpoint (`ws://` or `wss://`).
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Set the `connection_init` payload.
    #[must_use]
    pub fn with_connection_params(mut self, params: Value) -> Self {
        self.connection_params = Some(params);
        self
    }

    /// Set the bound on one connection attempt.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport.connect_timeout = timeout;
        self
    }

    /// Set keep-alive timing.
    #[must_use]
    pub const fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.transport.keepalive_interval = interval;
        self.transport.keepalive_timeout = timeout;
        self
    }

    /// Set reconnection backoff.
    #[must_use]
    pub const fn with_reconnect_delays(
        mut self,
        initial: Duration,
        max: Duration,
        multiplier: f64,
    ) -> Self {
        self.transport.reconnect_delay_initial = initial;
        self.transport.reconnect_delay_max = max;
        self.transport.reconnect_delay_multiplier = multiplier;
        self
    }

    /// Set the number of reconnection attempts (0 = unlimited).
    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.transport.max_reconnect_attempts = attempts;
        self
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Value could not be parsed.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
    /// Endpoint is not a usable WebSocket URL.
    #[error("invalid endpoint URL {0:?}: {1}")]
    InvalidUrl(String, &'static str),
}

/// Map an endpoint to its WebSocket form.
fn normalize_url(url: &str) -> Result<String, ConfigError> {
    let invalid = |reason| ConfigError::InvalidUrl(url.to_string(), reason);

    let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid("scheme must be ws, wss, http or https")),
    };

    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok(format!("{scheme}://{rest}"))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_case("ws://localhost:5000/graphql", "ws://localhost:5000/graphql" ; "ws kept")]
    #[test_case("wss://api.example.com/graphql", "wss://api.example.com/graphql" ; "wss kept")]
    #[test_case("http://localhost:5000/graphql", "ws://localhost:5000/graphql" ; "http mapped")]
    #[test_case("https://api.example.com/graphql", "wss://api.example.com/graphql" ; "https mapped")]
    #[test_case("HTTPS://api.example.com", "wss://api.example.com" ; "scheme case insensitive")]
    fn normalizes_endpoints(input: &str, expected: &str) {
        assert_eq!(ClientConfig::new(input).unwrap().url(), expected);
    }

    #[test_case("ftp://example.com" ; "unsupported scheme")]
    #[test_case("localhost:5000/graphql" ; "missing scheme")]
    #[test_case("ws:///graphql" ; "missing host")]
    fn rejects_invalid_endpoints(input: &str) {
        assert!(matches!(
            ClientConfig::new(input),
            Err(ConfigError::InvalidUrl(..))
        ));
    }

    #[test]
    fn transport_defaults() {
        let settings = TransportSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.keepalive_interval, Duration::from_secs(20));
        assert_eq!(settings.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(settings.reconnect_delay_initial, Duration::from_millis(500));
        assert_eq!(settings.reconnect_delay_max, Duration::from_secs(10));
        assert!((settings.reconnect_delay_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(settings.max_reconnect_attempts, 5);
    }

    #[test]
    fn from_lookup_requires_url() {
        assert_eq!(
            ClientConfig::from_lookup(env(&[])),
            Err(ConfigError::MissingEnvVar("GRAPHQL_WS_URL".to_string()))
        );
        assert_eq!(
            ClientConfig::from_lookup(env(&[("GRAPHQL_WS_URL", "  ")])),
            Err(ConfigError::EmptyValue("GRAPHQL_WS_URL".to_string()))
        );
    }

    #[test]
    fn from_lookup_reads_overrides() {
        let config = ClientConfig::from_lookup(env(&[
            ("GRAPHQL_WS_URL", "http://localhost:5000/graphql"),
            ("GRAPHQL_WS_CONNECTION_PARAMS", r#"{"authToken":"t"}"#),
            ("GRAPHQL_WS_CONNECT_TIMEOUT_MS", "2500"),
            ("GRAPHQL_WS_KEEPALIVE_INTERVAL_SECS", "5"),
            ("GRAPHQL_WS_KEEPALIVE_TIMEOUT_SECS", "15"),
            ("GRAPHQL_WS_RECONNECT_DELAY_INITIAL_MS", "100"),
            ("GRAPHQL_WS_RECONNECT_DELAY_MAX_SECS", "3"),
            ("GRAPHQL_WS_RECONNECT_DELAY_MULTIPLIER", "1.5"),
            ("GRAPHQL_WS_MAX_RECONNECT_ATTEMPTS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.url(), "ws://localhost:5000/graphql");
        assert_eq!(
            config.connection_params,
            Some(serde_json::json!({"authToken": "t"}))
        );
        assert_eq!(config.transport.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.transport.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.transport.keepalive_timeout, Duration::from_secs(15));
        assert_eq!(
            config.transport.reconnect_delay_initial,
            Duration::from_millis(100)
        );
        assert_eq!(config.transport.reconnect_delay_max, Duration::from_secs(3));
        assert!((config.transport.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.transport.max_reconnect_attempts, 0);
    }

    #[test]
    fn from_lookup_ignores_unparsable_numbers() {
        let config = ClientConfig::from_lookup(env(&[
            ("GRAPHQL_WS_URL", "ws://localhost/graphql"),
            ("GRAPHQL_WS_CONNECT_TIMEOUT_MS", "soon"),
        ]))
        .unwrap();

        assert_eq!(config.transport, TransportSettings::default());
    }

    #[test_case("not json" ; "malformed")]
    #[test_case("[1,2]" ; "not an object")]
    fn from_lookup_rejects_bad_connection_params(raw: &str) {
        let result = ClientConfig::from_lookup(env(&[
            ("GRAPHQL_WS_URL", "ws://localhost/graphql"),
            ("GRAPHQL_WS_CONNECTION_PARAMS", raw),
        ]));

        assert!(matches!(result, Err(ConfigError::InvalidValue(..))));
    }

    #[test]
    fn builder_overrides() {
        let config = ClientConfig::new("ws://localhost/graphql")
            .unwrap()
            .with_connect_timeout(Duration::from_secs(1))
            .with_keepalive(Duration::from_secs(2), Duration::from_secs(3))
            .with_reconnect_delays(Duration::from_millis(10), Duration::from_millis(50), 3.0)
            .with_max_reconnect_attempts(7);

        assert_eq!(config.transport.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.transport.keepalive_interval, Duration::from_secs(2));
        assert_eq!(config.transport.keepalive_timeout, Duration::from_secs(3));
        assert_eq!(config.transport.reconnect_delay_max, Duration::from_millis(50));
        assert_eq!(config.transport.max_reconnect_attempts, 7);
    }
}
