use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use qc_proxy::config::{DEFAULT_DEVICE_ADDR, DEFAULT_PROXY_ID};
use qc_proxy::logging::{init_logging, LoggingMode, LOG_MODE_ENV};
use qc_proxy::{Proxy, ProxyConfig, ProxyError};
use qc_state::ApiCatalog;

/// Proxy between a line-protocol embedded device and packet-framed clients
#[derive(Parser, Debug)]
#[command(name = "qcproxy")]
#[command(about = "Bridges an embedded device's line protocol to XML packet clients")]
#[command(version)]
pub struct Args {
    /// Address the client listener binds to
    #[arg(short, long, env = "QCPROXY_LISTEN", default_value = "0.0.0.0:6000")]
    pub listen: SocketAddr,

    /// Device address (host:port)
    #[arg(short, long, env = "QCPROXY_DEVICE", default_value = DEFAULT_DEVICE_ADDR)]
    pub device: String,

    /// Device API document
    #[arg(short, long, env = "QCPROXY_API_FILE", default_value = "deviceAPI.xml")]
    pub api_file: PathBuf,

    /// Token separator of the device line protocol
    #[arg(long, env = "QCPROXY_SEPARATOR", default_value = " ")]
    pub separator: char,

    /// Lower bound for auto-update and subscription intervals, in milliseconds
    #[arg(long, env = "QCPROXY_MIN_AUTO_UPDATE_MS", default_value = "10")]
    pub min_auto_update_ms: u64,

    /// Relay device commands verbatim instead of keeping state
    #[arg(long, env = "QCPROXY_PASS_THROUGH")]
    pub pass_through: bool,

    /// Override the Device API positiveAck setting (true or false)
    #[arg(long, env = "QCPROXY_POSITIVE_ACK")]
    pub positive_ack: Option<bool>,

    /// Send heartbeats to ready clients every N milliseconds
    #[arg(long, env = "QCPROXY_HEARTBEAT_MS")]
    pub heartbeat_ms: Option<u64>,

    /// Device timestamp ticks per second
    #[arg(long, env = "QCPROXY_TICK_RATE", default_value = "1000")]
    pub tick_rate: u32,

    /// Origin of outgoing packet ids
    #[arg(long, env = "QCPROXY_ID", default_value = DEFAULT_PROXY_ID)]
    pub proxy_id: String,

    /// Subscription interval used when a client asks for 0, in milliseconds
    #[arg(long, env = "QCPROXY_SUBSCRIPTION_INTERVAL_MS", default_value = "1000")]
    pub subscription_interval_ms: u64,

    /// Longest accepted device line in bytes
    #[arg(long, env = "QCPROXY_MAX_LINE_LENGTH", default_value = "4096")]
    pub max_line_length: usize,

    /// Packets queued for a slow client before further ones are dropped
    #[arg(long, env = "QCPROXY_CLIENT_QUEUE_LEN", default_value = "256")]
    pub client_queue_len: usize,

    /// Logging mode (silent, development, debug, json)
    #[arg(long, env = LOG_MODE_ENV, default_value = "development")]
    pub log_mode: String,

    /// Parse the Device API, print it as JSON and exit
    #[arg(long)]
    pub check_api: bool,
}

impl Args {
    pub fn logging_mode(&self) -> Result<LoggingMode> {
        self.log_mode
            .parse()
            .with_context(|| format!("Invalid --log-mode '{}'", self.log_mode))
    }
}

impl From<&Args> for ProxyConfig {
    fn from(args: &Args) -> Self {
        Self {
            listen_addr: args.listen,
            device_addr: args.device.clone(),
            api_file: args.api_file.clone(),
            separator: args.separator,
            min_auto_update: Duration::from_millis(args.min_auto_update_ms),
            pass_through: args.pass_through,
            positive_ack: args.positive_ack,
            heartbeat_interval: args.heartbeat_ms.map(Duration::from_millis),
            tick_rate: args.tick_rate,
            proxy_id: args.proxy_id.clone(),
            default_subscription_interval: Duration::from_millis(args.subscription_interval_ms),
            max_line_length: args.max_line_length,
            client_queue_len: args.client_queue_len,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.logging_mode()?).context("Failed to initialize logging")?;

    let config = ProxyConfig::from(&args);
    config.validate().context("Invalid configuration")?;

    let catalog = ApiCatalog::from_file(&config.api_file)
        .with_context(|| format!("Failed to load Device API from {}", config.api_file.display()))?;

    if args.check_api {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    info!(
        listen = %config.listen_addr,
        device = %config.device_addr,
        api_file = %config.api_file.display(),
        "Starting qcproxy"
    );

    let device = TcpStream::connect(&config.device_addr)
        .await
        .map_err(|source| ProxyError::DeviceConnect {
            addr: config.device_addr.clone(),
            source,
        })?;
    let api_file = config.api_file.clone();
    let proxy = Proxy::start(config, catalog, device).await?;

    if let Err(e) = wait_for_shutdown(&proxy, &api_file).await {
        error!(error = %e, "Signal handling failed");
    }

    proxy.shutdown().await;
    Ok(())
}

/// Wait for Ctrl+C; on Unix, SIGHUP reloads the Device API file
#[cfg(unix)]
async fn wait_for_shutdown(proxy: &Proxy, api_file: &std::path::Path) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Interrupted, shutting down");
                return Ok(());
            }
            _ = hangup.recv() => reload(proxy, api_file).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_proxy: &Proxy, _api_file: &std::path::Path) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    Ok(())
}

#[cfg(unix)]
async fn reload(proxy: &Proxy, api_file: &std::path::Path) {
    info!(api_file = %api_file.display(), "Reloading Device API");
    match tokio::fs::read_to_string(api_file).await {
        Ok(document) => {
            if let Err(e) = proxy.reload_api(document) {
                warn!(error = %e, "Device API reload not delivered");
            }
        }
        Err(e) => warn!(error = %e, "Failed to read Device API file"),
    }
}
