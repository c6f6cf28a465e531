//! # qc-proxy
//!
//! Sits between one embedded device speaking a text line protocol and any
//! number of network clients speaking length-prefixed XML packets.
//!
//! # Architecture
//!
//! ```text
//!                 DeviceLink                        ClientServer
//! device ◀──lines──▶ reader/writer ──▶ Router ◀── reader/writer per client ◀──packets──▶ clients
//!                                       │
//!                      StateStore · ApiCatalog · SubscriptionManager
//! ```
//!
//! Every transport task posts [`RouterEvent`]s to the single [`Router`] task,
//! which owns all state. The router answers client requests from the store,
//! converts values between the device and user representation, and pushes
//! subscribed values to clients on their timers.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use qc_proxy::{Proxy, ProxyConfig};
//! use qc_state::ApiCatalog;
//!
//! let config = ProxyConfig::development();
//! let catalog = ApiCatalog::from_file(&config.api_file)?;
//! let device = tokio::net::TcpStream::connect(&config.device_addr).await?;
//!
//! let proxy = Proxy::start(config, catalog, device).await?;
//! println!("clients connect to {}", proxy.local_addr());
//! tokio::signal::ctrl_c().await?;
//! proxy.shutdown().await;
//! ```

pub mod clock;
pub mod config;
pub mod connection;
pub mod device_link;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod proxy;
pub mod router;
pub mod server;
pub mod subscription;

pub use clock::DeviceClock;
pub use config::{
    ProxyConfig, DEFAULT_CLIENT_QUEUE_LEN, DEFAULT_DEVICE_ADDR, DEFAULT_LISTEN_PORT, DEFAULT_PROXY_ID,
};
pub use connection::{ClientId, Connection, ConnectionState, Role};
pub use device_link::DeviceLink;
pub use error::{ConfigError, ProxyError, Result};
pub use heartbeat::{HeartbeatCounter, Liveness};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};
pub use proxy::Proxy;
pub use router::{Router, RouterEvent};
pub use server::ClientServer;
pub use subscription::{FeedRequest, Subscription, SubscriptionManager};
