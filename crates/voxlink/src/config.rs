use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::net::{DEFAULT_PORT, ReliabilitySettings};

pub const MAX_USERNAME_LEN: usize = 20;

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Client session settings. Durations are given in milliseconds in JSON and
/// option form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub keep_alive_interval: Duration,
    pub max_retransmits: u32,
    #[serde(with = "millis")]
    pub initial_rto: Duration,
    #[serde(with = "millis")]
    pub min_rto: Duration,
    #[serde(with = "millis")]
    pub max_rto: Duration,
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    pub event_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let reliability = ReliabilitySettings::default();
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_millis(10_000),
            keep_alive_interval: Duration::from_millis(2_000),
            max_retransmits: reliability.max_retransmits,
            initial_rto: reliability.initial_rto,
            min_rto: reliability.min_rto,
            max_rto: reliability.max_rto,
            tick_interval: Duration::from_millis(50),
            event_queue_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_max_retransmits(mut self, max_retransmits: u32) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }

    pub fn with_rto(mut self, initial: Duration, min: Duration, max: Duration) -> Self {
        self.initial_rto = initial;
        self.min_rto = min;
        self.max_rto = max;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Builds a config from `key=value` style pairs using the JSON key names.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            config.set_option(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides a single field. Does not validate.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = parse(key, value)?,
            "username" => self.username = value.to_string(),
            "password" => self.password = value.to_string(),
            "connectTimeout" => self.connect_timeout = parse_millis(key, value)?,
            "keepAliveInterval" => self.keep_alive_interval = parse_millis(key, value)?,
            "maxRetransmits" => self.max_retransmits = parse(key, value)?,
            "initialRto" => self.initial_rto = parse_millis(key, value)?,
            "minRto" => self.min_rto = parse_millis(key, value)?,
            "maxRto" => self.max_rto = parse_millis(key, value)?,
            "tickInterval" => self.tick_interval = parse_millis(key, value)?,
            "eventQueueCapacity" => self.event_queue_capacity = parse(key, value)?,
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.host.is_empty() {
            return invalid("host must not be empty".into());
        }
        if self.port == 0 {
            return invalid("port must not be 0".into());
        }
        if self.username.is_empty() || self.username.len() > MAX_USERNAME_LEN {
            return invalid(format!(
                "username must be 1 to {MAX_USERNAME_LEN} characters"
            ));
        }
        if !self
            .username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return invalid(format!(
                "username `{}` may only contain letters, digits, `_` and `-`",
                self.username
            ));
        }
        if self.connect_timeout.is_zero() {
            return invalid("connectTimeout must be positive".into());
        }
        if self.max_retransmits == 0 || self.max_retransmits > 32 {
            return invalid("maxRetransmits must be between 1 and 32".into());
        }
        if self.min_rto.is_zero() {
            return invalid("minRto must be positive".into());
        }
        if !(self.min_rto <= self.initial_rto && self.initial_rto <= self.max_rto) {
            return invalid("RTO bounds must satisfy minRto <= initialRto <= maxRto".into());
        }
        if self.tick_interval < Duration::from_millis(10)
            || self.tick_interval > Duration::from_millis(1000)
        {
            return invalid("tickInterval must be between 10 and 1000 ms".into());
        }
        if self.tick_interval >= self.keep_alive_interval {
            return invalid("tickInterval must be shorter than keepAliveInterval".into());
        }
        if self.event_queue_capacity == 0 {
            return invalid("eventQueueCapacity must be positive".into());
        }
        Ok(())
    }

    /// Silence longer than this ends the session.
    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_interval.saturating_mul(self.max_retransmits)
    }

    pub fn reliability(&self) -> ReliabilitySettings {
        ReliabilitySettings {
            initial_rto: self.initial_rto,
            min_rto: self.min_rto,
            max_rto: self.max_rto,
            max_retransmits: self.max_retransmits,
            ..ReliabilitySettings::default()
        }
    }

    pub fn server_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("bob");
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 30000);
        assert_eq!(config.keep_alive_timeout(), Duration::from_secs(16));
        assert_eq!(config.server_addr(), "127.0.0.1:30000");
    }

    #[test]
    fn test_from_json() {
        let config = ClientConfig::from_json(
            r#"{"host":"example.net","username":"alice","password":"pw","keepAliveInterval":500,"maxRetransmits":3}"#,
        )
        .unwrap();

        assert_eq!(config.host, "example.net");
        assert_eq!(config.password, "pw");
        assert_eq!(config.keep_alive_interval, Duration::from_millis(500));
        assert_eq!(config.max_retransmits, 3);
        assert_eq!(config.tick_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_unknown_json_key_rejected() {
        let err = ClientConfig::from_json(r#"{"username":"alice","colour":"red"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_from_options() {
        let config = ClientConfig::from_options([
            ("username", "carol"),
            ("port", "30001"),
            ("connectTimeout", "2500"),
        ])
        .unwrap();
        assert_eq!(config.port, 30001);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));

        let err = ClientConfig::from_options([("username", "carol"), ("port", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "port"));

        let err = ClientConfig::from_options([("speed", "11")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(ref key) if key == "speed"));
    }

    #[test]
    fn test_validation() {
        assert!(ClientConfig::default().validate().is_err());
        assert!(ClientConfig::new("no spaces").validate().is_err());
        assert!(ClientConfig::new("a".repeat(21)).validate().is_err());
        assert!(
            ClientConfig::new("bob")
                .with_rto(
                    Duration::from_millis(50),
                    Duration::from_millis(100),
                    Duration::from_millis(200)
                )
                .validate()
                .is_err()
        );
        assert!(
            ClientConfig::new("bob")
                .with_keep_alive_interval(Duration::from_millis(40))
                .validate()
                .is_err()
        );
        assert!(
            ClientConfig::new("bob")
                .with_event_queue_capacity(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_ipv6_server_addr() {
        let config = ClientConfig::new("bob").with_server("::1", 4000);
        assert_eq!(config.server_addr(), "[::1]:4000");
    }
}
