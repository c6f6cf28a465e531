//! Logging infrastructure for the proxy
//!
//! Installs a `tracing-subscriber` registry whose output format depends on
//! the selected [`LoggingMode`]. Device `proxy message` calls are logged under
//! the `device` target so they can be filtered separately.

use std::str::FromStr;

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable selecting the logging mode
pub const LOG_MODE_ENV: &str = "QCPROXY_LOG_MODE";

/// Environment variable overriding the log filter
pub const LOG_LEVEL_ENV: &str = "QCPROXY_LOG_LEVEL";

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// No output
    Silent,
    /// Compact stderr output
    #[default]
    Development,
    /// Verbose diagnostics with source locations
    Debug,
    /// One JSON object per event, for log collectors
    Json,
}

impl FromStr for LoggingMode {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => Ok(Self::Silent),
            "development" | "dev" => Ok(Self::Development),
            "debug" => Ok(Self::Debug),
            "json" => Ok(Self::Json),
            other => Err(LoggingError::InvalidEnv(format!("unknown logging mode '{other}'"))),
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Initialize logging with the specified mode
///
/// # Environment Variables
///
/// - `QCPROXY_LOG_LEVEL`: filter directives (`info`, `qc_proxy=debug,device=info`, ...)
/// - `RUST_LOG`: used when `QCPROXY_LOG_LEVEL` is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter("info");

            Registry::default()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .compact(),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let filter = create_env_filter("debug");

            Registry::default()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Json => {
            let filter = create_env_filter("info");

            Registry::default()
                .with(fmt::layer().json().with_current_span(false))
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize logging from `QCPROXY_LOG_MODE`
///
/// Defaults to [`LoggingMode::Development`] when unset.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(LOG_MODE_ENV) {
        Ok(value) => value.parse()?,
        Err(_) => LoggingMode::default(),
    };

    init_logging(mode)
}

/// `QCPROXY_LOG_LEVEL`, then `RUST_LOG`, then the mode default
fn create_env_filter(default_level: &str) -> EnvFilter {
    if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        EnvFilter::new(level)
    } else if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        EnvFilter::new(default_level)
    }
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}
