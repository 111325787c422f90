//! Quote Stream Configuration Settings
//!
//! Configuration types for the quote stream, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::domain::subscription::Symbol;
use crate::infrastructure::alpaca::{
    Credentials, HeartbeatConfig, ReconnectConfig, SessionOptions, StreamConnector,
    StreamEndpoint,
};

/// Market data feed type for the quote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFeed {
    /// SIP (Securities Information Processor) - Full market data.
    Sip,
    /// IEX (Investors Exchange) - Free tier with limited data.
    #[default]
    Iex,
    /// Test feed serving the `FAKEPACA` symbol around the clock.
    Test,
}

impl DataFeed {
    /// Parse feed type from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "sip" => Self::Sip,
            "test" => Self::Test,
            _ => Self::Iex,
        }
    }

    /// Get the feed name for WebSocket URLs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sip => "sip",
            Self::Iex => "iex",
            Self::Test => "test",
        }
    }
}

/// Trading environment (paper vs live).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    /// Paper trading environment (simulated).
    #[default]
    Paper,
    /// Live trading environment (real money).
    Live,
}

impl Environment {
    /// Parse environment from string. `prod` and `live` select live.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "LIVE" | "PROD" => Self::Live,
            _ => Self::Paper,
        }
    }

    /// Check if this is the live environment.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the environment name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Live => "live",
        }
    }

    /// Prefix of the credential and endpoint variables.
    #[must_use]
    pub const fn var_prefix(&self) -> &'static str {
        match self {
            Self::Paper => "APCA_PAPER",
            Self::Live => "APCA_LIVE",
        }
    }

    /// Default REST base URL.
    #[must_use]
    pub const fn default_base_url(&self) -> &'static str {
        match self {
            Self::Paper => "https://paper-api.alpaca.markets",
            Self::Live => "https://api.alpaca.markets",
        }
    }
}

/// Session connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Delay after the first failed reconnect attempt.
    pub reconnect_delay: Duration,
    /// Maximum reconnect delay.
    pub reconnect_delay_max: Duration,
    /// Reconnect delay growth factor (1.0 = fixed delay).
    pub reconnect_multiplier: f64,
    /// Maximum reconnect attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Heartbeat ping interval (zero disables heartbeat monitoring).
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// Subscription ack timeout.
    pub ack_timeout: Duration,
    /// Capacity of the batch stream handed to the consumer.
    pub output_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(30),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_multiplier: 1.0,
            max_reconnect_attempts: 0, // Unlimited
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            output_capacity: 1024,
        }
    }
}

/// Process-level settings for the `quote-stream` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
    /// Interval between price book reports.
    pub report_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            metrics_port: 9090,
            report_interval: Duration::from_secs(5),
        }
    }
}

/// Complete quote stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Trading environment.
    pub environment: Environment,
    /// Market data feed type.
    pub feed: DataFeed,
    /// API credentials.
    pub credentials: Credentials,
    /// REST base URL, used for the handshake origin.
    pub base_url: String,
    /// API version, used for the handshake origin.
    pub api_version: String,
    /// Quote stream WebSocket URL.
    pub market_stream: String,
    /// Initial subscription.
    pub symbols: Vec<Symbol>,
    /// Session connection settings.
    pub session: SessionSettings,
    /// Process-level settings.
    pub server: ServerSettings,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or
    /// a present value cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or a present
    /// value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = lookup("APCA_ENVIRONMENT")
            .map(|s| Environment::from_str_case_insensitive(&s))
            .unwrap_or_default();
        let feed = lookup("ALPACA_FEED")
            .map(|s| DataFeed::from_str_case_insensitive(&s))
            .unwrap_or_default();
        let prefix = environment.var_prefix();

        let api_key = required(&lookup, &format!("{prefix}_API_KEY"))?;
        let api_secret = required(&lookup, &format!("{prefix}_API_SECRET"))?;
        let credentials = Credentials::new(api_key, api_secret).map_err(|_| {
            ConfigError::EmptyValue(format!("{prefix}_API_KEY/{prefix}_API_SECRET"))
        })?;

        let base_url = lookup(&format!("{prefix}_BASE_URL"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| environment.default_base_url().to_string());
        let api_version = lookup(&format!("{prefix}_API_VERSION"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "v2".to_string());
        let market_stream = lookup(&format!("{prefix}_MARKET_STREAM"))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| {
                format!("wss://stream.data.alpaca.markets/v2/{}", feed.as_str())
            });

        let symbols = lookup("QUOTE_STREAM_SYMBOLS")
            .map_or_else(|| vec!["FAKEPACA".to_string()], |v| parse_symbols(&v));

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            reconnect_delay: parse_secs(
                &lookup,
                "QUOTE_STREAM_RECONNECT_DELAY_SECS",
                defaults.reconnect_delay,
            )?,
            reconnect_delay_max: parse_secs(
                &lookup,
                "QUOTE_STREAM_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            )?,
            reconnect_multiplier: parse_or(
                &lookup,
                "QUOTE_STREAM_RECONNECT_MULTIPLIER",
                defaults.reconnect_multiplier,
            )?,
            max_reconnect_attempts: parse_or(
                &lookup,
                "QUOTE_STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            heartbeat_interval: parse_secs(
                &lookup,
                "QUOTE_STREAM_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: parse_secs(
                &lookup,
                "QUOTE_STREAM_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            )?,
            connect_timeout: parse_secs(
                &lookup,
                "QUOTE_STREAM_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            )?,
            ack_timeout: parse_secs(&lookup, "QUOTE_STREAM_ACK_TIMEOUT_SECS", defaults.ack_timeout)?,
            output_capacity: parse_or(
                &lookup,
                "QUOTE_STREAM_OUTPUT_CAPACITY",
                defaults.output_capacity,
            )?,
        };

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            metrics_port: parse_or(
                &lookup,
                "QUOTE_STREAM_METRICS_PORT",
                server_defaults.metrics_port,
            )?,
            report_interval: parse_secs(
                &lookup,
                "QUOTE_STREAM_REPORT_INTERVAL_SECS",
                server_defaults.report_interval,
            )?,
        };

        Ok(Self {
            environment,
            feed,
            credentials,
            base_url,
            api_version,
            market_stream,
            symbols,
            session,
            server,
        })
    }

    /// Endpoint to dial.
    #[must_use]
    pub fn endpoint(&self) -> StreamEndpoint {
        StreamEndpoint::new(&self.market_stream, &self.base_url, &self.api_version)
    }

    /// Connector for the configured endpoint and credentials.
    #[must_use]
    pub fn connector(&self) -> StreamConnector {
        StreamConnector::new(self.endpoint(), self.credentials.clone())
            .with_connect_timeout(self.session.connect_timeout)
    }

    /// Session tuning derived from the connection settings.
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        let s = &self.session;
        let reconnect = ReconnectConfig::exponential(
            s.reconnect_delay,
            s.reconnect_delay_max.max(s.reconnect_delay),
            s.reconnect_multiplier.max(1.0),
        )
        .with_max_attempts(s.max_reconnect_attempts);

        SessionOptions::default()
            .with_reconnect(reconnect)
            .with_heartbeat(HeartbeatConfig::enabled(
                s.heartbeat_interval,
                s.heartbeat_timeout,
            ))
            .with_ack_timeout(s.ack_timeout)
            .with_output_capacity(s.output_capacity.max(1))
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is present but cannot be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v,
        }),
    }
}

fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const PAPER_CREDS: &[(&str, &str)] = &[
        ("APCA_PAPER_API_KEY", "key123"),
        ("APCA_PAPER_API_SECRET", "secret456"),
    ];

    #[test]
    fn data_feed_parsing() {
        assert_eq!(DataFeed::from_str_case_insensitive("sip"), DataFeed::Sip);
        assert_eq!(DataFeed::from_str_case_insensitive("SIP"), DataFeed::Sip);
        assert_eq!(DataFeed::from_str_case_insensitive("iex"), DataFeed::Iex);
        assert_eq!(DataFeed::from_str_case_insensitive("Test"), DataFeed::Test);
        assert_eq!(
            DataFeed::from_str_case_insensitive("unknown"),
            DataFeed::Iex
        );
    }

    #[test]
    fn environment_parsing() {
        assert_eq!(
            Environment::from_str_case_insensitive("live"),
            Environment::Live
        );
        assert_eq!(
            Environment::from_str_case_insensitive("prod"),
            Environment::Live
        );
        assert_eq!(
            Environment::from_str_case_insensitive("paper"),
            Environment::Paper
        );
        assert_eq!(
            Environment::from_str_case_insensitive("unknown"),
            Environment::Paper
        );
        assert!(Environment::Live.is_live());
        assert_eq!(Environment::Live.var_prefix(), "APCA_LIVE");
    }

    #[test]
    fn paper_defaults() {
        let config = StreamConfig::from_lookup(lookup_from(PAPER_CREDS)).unwrap();

        assert_eq!(config.environment, Environment::Paper);
        assert_eq!(config.feed, DataFeed::Iex);
        assert_eq!(config.credentials.key(), "key123");
        assert_eq!(config.base_url, "https://paper-api.alpaca.markets");
        assert_eq!(config.api_version, "v2");
        assert_eq!(
            config.market_stream,
            "wss://stream.data.alpaca.markets/v2/iex"
        );
        assert_eq!(config.symbols, vec!["FAKEPACA".to_string()]);
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.server, ServerSettings::default());
        assert_eq!(
            config.endpoint().origin(),
            "https://paper-api.alpaca.markets/v2"
        );
    }

    #[test]
    fn live_environment_uses_live_prefix() {
        let config = StreamConfig::from_lookup(lookup_from(&[
            ("APCA_ENVIRONMENT", "prod"),
            ("APCA_LIVE_API_KEY", "live-key"),
            ("APCA_LIVE_API_SECRET", "live-secret"),
            ("ALPACA_FEED", "sip"),
        ]))
        .unwrap();

        assert_eq!(config.environment, Environment::Live);
        assert_eq!(config.credentials.key(), "live-key");
        assert_eq!(config.base_url, "https://api.alpaca.markets");
        assert_eq!(
            config.market_stream,
            "wss://stream.data.alpaca.markets/v2/sip"
        );
    }

    #[test]
    fn missing_key_is_reported_with_prefix() {
        let err = StreamConfig::from_lookup(lookup_from(&[("APCA_PAPER_API_SECRET", "s")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingEnvVar("APCA_PAPER_API_KEY".to_string())
        );
    }

    #[test]
    fn empty_secret_is_rejected() {
        let err = StreamConfig::from_lookup(lookup_from(&[
            ("APCA_PAPER_API_KEY", "k"),
            ("APCA_PAPER_API_SECRET", ""),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::EmptyValue("APCA_PAPER_API_SECRET".to_string())
        );
    }

    #[test]
    fn overrides_are_applied() {
        let mut pairs = PAPER_CREDS.to_vec();
        pairs.extend_from_slice(&[
            ("APCA_PAPER_MARKET_STREAM", "ws://127.0.0.1:8080/pricing"),
            ("APCA_PAPER_BASE_URL", "http://localhost:8080/"),
            ("QUOTE_STREAM_SYMBOLS", " aca, aapl ,,MSFT"),
            ("QUOTE_STREAM_RECONNECT_DELAY_SECS", "1"),
            ("QUOTE_STREAM_RECONNECT_DELAY_MAX_SECS", "8"),
            ("QUOTE_STREAM_RECONNECT_MULTIPLIER", "2.0"),
            ("QUOTE_STREAM_HEARTBEAT_INTERVAL_SECS", "0"),
            ("QUOTE_STREAM_METRICS_PORT", "0"),
        ]);
        let config = StreamConfig::from_lookup(lookup_from(&pairs)).unwrap();

        assert_eq!(config.market_stream, "ws://127.0.0.1:8080/pricing");
        assert_eq!(config.endpoint().origin(), "http://localhost:8080/v2");
        assert_eq!(config.symbols, vec!["ACA", "AAPL", "MSFT"]);
        assert_eq!(config.server.metrics_port, 0);

        let options = config.session_options();
        assert_eq!(options.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(options.reconnect.max_delay, Duration::from_secs(8));
        assert!((options.reconnect.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(options.heartbeat.is_none());
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let mut pairs = PAPER_CREDS.to_vec();
        pairs.push(("QUOTE_STREAM_ACK_TIMEOUT_SECS", "ten"));
        let err = StreamConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "QUOTE_STREAM_ACK_TIMEOUT_SECS".to_string(),
                value: "ten".to_string(),
            }
        );
    }

    #[test]
    fn default_session_options_use_fixed_thirty_second_delay() {
        let config = StreamConfig::from_lookup(lookup_from(PAPER_CREDS)).unwrap();
        let options = config.session_options();
        assert_eq!(options.reconnect, ReconnectConfig::fixed(Duration::from_secs(30)));
        assert_eq!(
            options.heartbeat,
            Some(HeartbeatConfig {
                ping_interval: Duration::from_secs(20),
                timeout: Duration::from_secs(60),
            })
        );
    }

    #[test]
    fn credentials_redacted_debug() {
        let config = StreamConfig::from_lookup(lookup_from(PAPER_CREDS)).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("key123"));
        assert!(!debug.contains("secret456"));
    }
}
