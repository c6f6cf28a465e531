//! Configuration types for the proxy
//!
//! Settings come from the command line and the environment; the binary maps
//! its arguments into a [`ProxyConfig`] and validates it before starting.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use qc_protocol::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_SEPARATOR};
use qc_state::DEFAULT_MIN_AUTO_UPDATE;

use crate::error::ConfigError;

/// Default client listener port
pub const DEFAULT_LISTEN_PORT: u16 = 6000;

/// Default device address
pub const DEFAULT_DEVICE_ADDR: &str = "127.0.0.1:6001";

/// Default packet id origin of the proxy
pub const DEFAULT_PROXY_ID: &str = "qcProxy";

/// Default number of packets queued for one client before new ones are dropped
pub const DEFAULT_CLIENT_QUEUE_LEN: usize = 256;

/// Shortest line that can hold a device command such as `get a b`
const MIN_LINE_LENGTH: usize = 8;

/// Configuration for the proxy
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Address the client listener binds to
    /// Default: 0.0.0.0:6000
    pub listen_addr: SocketAddr,

    /// Device address (`host:port`)
    /// Default: 127.0.0.1:6001
    pub device_addr: String,

    /// Device API document
    /// Default: deviceAPI.xml
    pub api_file: PathBuf,

    /// Token separator of the device line protocol
    /// Default: space
    pub separator: char,

    /// Lower bound for auto-update and subscription intervals
    /// Default: 10 ms
    pub min_auto_update: Duration,

    /// Relay device commands verbatim instead of going through the store
    /// Default: false
    pub pass_through: bool,

    /// Overrides the Device API `positiveAck` setting when present
    /// Default: None
    pub positive_ack: Option<bool>,

    /// Interval of proxy heartbeats to ready clients, disabled when unset
    /// Default: None
    pub heartbeat_interval: Option<Duration>,

    /// Device timestamp ticks per second
    /// Default: 1000
    pub tick_rate: u32,

    /// Origin used in outgoing packet ids and the handshake identity
    /// Default: qcProxy
    pub proxy_id: String,

    /// Subscription interval used when a client asks for 0
    /// Default: 1000 ms
    pub default_subscription_interval: Duration,

    /// Longest accepted device line in bytes
    /// Default: 4096
    pub max_line_length: usize,

    /// Packets queued for a client that is not reading; further packets are dropped
    /// Default: 256
    pub client_queue_len: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LISTEN_PORT)),
            device_addr: DEFAULT_DEVICE_ADDR.to_string(),
            api_file: PathBuf::from("deviceAPI.xml"),
            separator: DEFAULT_SEPARATOR,
            min_auto_update: DEFAULT_MIN_AUTO_UPDATE,
            pass_through: false,
            positive_ack: None,
            heartbeat_interval: None,
            tick_rate: 1000,
            proxy_id: DEFAULT_PROXY_ID.to_string(),
            default_subscription_interval: Duration::from_millis(1000),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            client_queue_len: DEFAULT_CLIENT_QUEUE_LEN,
        }
    }
}

impl ProxyConfig {
    /// Create a ProxyConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Local-only listener with heartbeats, for bench work next to the device
    pub fn development() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
            heartbeat_interval: Some(Duration::from_secs(5)),
            ..Default::default()
        }
    }

    /// Relay device traffic verbatim
    pub fn pass_through() -> Self {
        Self {
            pass_through: true,
            ..Default::default()
        }
    }

    /// Validate the configuration and return the first issue found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_id.is_empty() || self.proxy_id.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidProxyId(self.proxy_id.clone()));
        }

        if matches!(self.separator, '\n' | '\r' | '"' | '@') || self.separator.is_alphanumeric() {
            return Err(ConfigError::InvalidSeparator(self.separator));
        }

        if self.device_addr.trim().is_empty() {
            return Err(ConfigError::MissingDeviceAddress);
        }

        if self.min_auto_update == Duration::ZERO {
            return Err(ConfigError::ZeroInterval("Minimum auto-update interval"));
        }

        if self.default_subscription_interval == Duration::ZERO {
            return Err(ConfigError::ZeroInterval("Default subscription interval"));
        }

        if self.heartbeat_interval == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroInterval("Heartbeat interval"));
        }

        if self.tick_rate == 0 {
            return Err(ConfigError::ZeroTickRate);
        }

        if self.max_line_length < MIN_LINE_LENGTH {
            return Err(ConfigError::LineLengthTooSmall(self.max_line_length));
        }

        if self.client_queue_len == 0 {
            return Err(ConfigError::ZeroClientQueue);
        }

        Ok(())
    }

    /// Identity announced in handshakes
    pub fn identity(&self) -> BTreeMap<String, String> {
        [
            ("id", self.proxy_id.as_str()),
            ("name", "qcproxy"),
            ("version", env!("CARGO_PKG_VERSION")),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr.port(), 6000);
        assert_eq!(config.device_addr, "127.0.0.1:6001");
        assert_eq!(config.separator, ' ');
        assert_eq!(config.min_auto_update, Duration::from_millis(10));
        assert_eq!(config.tick_rate, 1000);
        assert_eq!(config.proxy_id, "qcProxy");
        assert_eq!(config.default_subscription_interval, Duration::from_secs(1));
        assert!(config.heartbeat_interval.is_none());
        assert_eq!(config.client_queue_len, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(ProxyConfig::development().validate().is_ok());
        assert!(ProxyConfig::development().listen_addr.ip().is_loopback());
        assert!(ProxyConfig::pass_through().validate().is_ok());
        assert!(ProxyConfig::pass_through().pass_through);
    }

    #[rstest]
    #[case::empty_id(ProxyConfig { proxy_id: String::new(), ..Default::default() })]
    #[case::spaced_id(ProxyConfig { proxy_id: "qc proxy".into(), ..Default::default() })]
    #[case::newline_separator(ProxyConfig { separator: '\n', ..Default::default() })]
    #[case::letter_separator(ProxyConfig { separator: 'x', ..Default::default() })]
    #[case::no_device(ProxyConfig { device_addr: " ".into(), ..Default::default() })]
    #[case::zero_min(ProxyConfig { min_auto_update: Duration::ZERO, ..Default::default() })]
    #[case::zero_heartbeat(ProxyConfig { heartbeat_interval: Some(Duration::ZERO), ..Default::default() })]
    #[case::zero_tick_rate(ProxyConfig { tick_rate: 0, ..Default::default() })]
    #[case::short_lines(ProxyConfig { max_line_length: 4, ..Default::default() })]
    #[case::zero_queue(ProxyConfig { client_queue_len: 0, ..Default::default() })]
    fn test_invalid_configs(#[case] config: ProxyConfig) {
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identity_carries_proxy_id() {
        let config = ProxyConfig {
            proxy_id: "bench".into(),
            ..Default::default()
        };
        let identity = config.identity();
        assert_eq!(identity.get("id").map(String::as_str), Some("bench"));
        assert!(identity.contains_key("version"));
    }
}
