//! Assembles router, client listener and device link into one running proxy

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use qc_protocol::CommandRegistry;
use qc_state::ApiCatalog;

use crate::config::ProxyConfig;
use crate::device_link::DeviceLink;
use crate::error::{ProxyError, Result};
use crate::router::{Router, RouterEvent};
use crate::server::ClientServer;

/// A running proxy
///
/// Dropping the handle without [`Proxy::shutdown`] aborts every task.
#[derive(Debug)]
pub struct Proxy {
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<RouterEvent>,
    router: Option<JoinHandle<()>>,
    accept: JoinHandle<()>,
    _device: DeviceLink,
}

impl Proxy {
    /// Validate `config`, bind the client listener and start serving `device`
    pub async fn start<D>(config: ProxyConfig, catalog: ApiCatalog, device: D) -> Result<Self>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let registry = Arc::new(CommandRegistry::with_builtins());

        let server = ClientServer::bind(config.listen_addr, config.proxy_id.clone(), registry.clone())
            .await?
            .with_queue_len(config.client_queue_len);
        let local_addr = server.local_addr()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        let router = Router::new(&config, catalog, registry, line_tx);
        let device = DeviceLink::spawn(device, config.max_line_length, event_tx.clone(), line_rx);
        let accept = server.spawn(event_tx.clone());
        let router = tokio::spawn(router.run(event_rx));

        info!(%local_addr, device = %config.device_addr, pass_through = config.pass_through, "Proxy started");
        Ok(Self {
            local_addr,
            events: event_tx,
            router: Some(router),
            accept,
            _device: device,
        })
    }

    /// Address clients connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Replace the Device API with `document`
    ///
    /// The document is parsed by the router; a broken one is logged and the
    /// current API stays active.
    pub fn reload_api(&self, document: String) -> Result<()> {
        self.events
            .send(RouterEvent::ReloadApi(document))
            .map_err(|_| ProxyError::ChannelClosed)
    }

    /// Stop accepting clients and wait for the router to finish
    pub async fn shutdown(mut self) {
        self.accept.abort();
        let _ = self.events.send(RouterEvent::Shutdown);
        if let Some(router) = self.router.take() {
            if let Err(e) = router.await {
                warn!(error = %e, "Router task ended abnormally");
            }
        }
        info!("Proxy stopped");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept.abort();
        if let Some(router) = &self.router {
            router.abort();
        }
    }
}
