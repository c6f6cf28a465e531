use std::net::SocketAddr;

use thiserror::Error;

use qc_state::ApiError;

/// Configuration validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The proxy id is empty or contains whitespace
    #[error("Invalid proxy id '{0}': must be non-empty and contain no whitespace")]
    InvalidProxyId(String),

    /// The device separator cannot delimit tokens
    #[error("Invalid device separator {0:?}")]
    InvalidSeparator(char),

    /// The device address is empty
    #[error("Device address must not be empty")]
    MissingDeviceAddress,

    /// A duration setting is zero
    #[error("{0} must be greater than 0")]
    ZeroInterval(&'static str),

    /// The device tick rate is zero
    #[error("Device tick rate must be greater than 0")]
    ZeroTickRate,

    /// The line limit cannot hold a minimal device command
    #[error("Maximum device line length {0} is too small")]
    LineLengthTooSmall(usize),

    /// Clients would have no room for a single outgoing packet
    #[error("Client queue length must be greater than 0")]
    ZeroClientQueue,
}

/// Errors that stop the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The Device API could not be loaded
    #[error("Device API error: {0}")]
    Api(#[from] ApiError),

    /// The client listener could not be bound
    #[error("Failed to bind client listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The device could not be reached
    #[error("Failed to connect to device at {addr}: {source}")]
    DeviceConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinator task is gone
    #[error("Router channel has been closed")]
    ChannelClosed,
}

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::ZeroInterval("Heartbeat interval").to_string(),
            "Heartbeat interval must be greater than 0"
        );
        assert_eq!(
            ConfigError::InvalidSeparator('\n').to_string(),
            "Invalid device separator '\\n'"
        );
    }

    #[test]
    fn test_proxy_error_from_config() {
        let error: ProxyError = ConfigError::ZeroTickRate.into();
        assert!(matches!(error, ProxyError::Config(ConfigError::ZeroTickRate)));
        assert!(error.to_string().starts_with("Invalid configuration"));
    }

    #[test]
    fn test_bind_error_display() {
        let error = ProxyError::Bind {
            addr: "127.0.0.1:6000".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(
            error.to_string(),
            "Failed to bind client listener on 127.0.0.1:6000: in use"
        );
    }
}
