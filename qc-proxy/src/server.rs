//! TCP listener for clients
//!
//! Every accepted socket gets a [`ClientId`], a reader task decoding packets
//! into router events and a writer task encoding the router's packets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use qc_protocol::{CommandRegistry, OutgoingPacket, PacketCodec, PacketError};

use crate::config::DEFAULT_CLIENT_QUEUE_LEN;
use crate::connection::ClientId;
use crate::error::{ProxyError, Result};
use crate::router::RouterEvent;

/// Pause after the first failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Longest pause between failed accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// A bound client listener
#[derive(Debug)]
pub struct ClientServer {
    listener: TcpListener,
    proxy_id: String,
    registry: Arc<CommandRegistry>,
    queue_len: usize,
}

impl ClientServer {
    /// Bind the listener; port 0 picks a free port
    pub async fn bind(addr: SocketAddr, proxy_id: impl Into<String>, registry: Arc<CommandRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        info!(addr = %listener.local_addr()?, "Listening for clients");
        Ok(Self {
            listener,
            proxy_id: proxy_id.into(),
            registry,
            queue_len: DEFAULT_CLIENT_QUEUE_LEN,
        })
    }

    /// Packets queued per client before the router starts dropping them
    pub fn with_queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients on a background task until it is aborted
    pub fn spawn(self, events: mpsc::UnboundedSender<RouterEvent>) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(events))
    }

    async fn accept_loop(self, events: mpsc::UnboundedSender<RouterEvent>) {
        let mut next_id = 1;
        let mut failures = 0;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => {
                    failures = 0;
                    accepted
                }
                Err(e) => {
                    failures += 1;
                    let pause = accept_backoff(failures);
                    warn!(error = %e, failures, ?pause, "Accept failed");
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };

            let client = ClientId(next_id);
            next_id += 1;
            info!(%client, %peer, "Client accepted");
            if !self.serve(client, stream, &events) {
                debug!("Router gone, listener stopping");
                return;
            }
        }
    }

    fn serve(&self, client: ClientId, stream: TcpStream, events: &mpsc::UnboundedSender<RouterEvent>) -> bool {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%client, error = %e, "Could not disable Nagle");
        }
        let (read_half, write_half) = stream.into_split();
        let (sender, packets) = mpsc::channel(self.queue_len);

        if events.send(RouterEvent::ClientConnected { client, sender }).is_err() {
            return false;
        }

        let reader = FramedRead::new(read_half, PacketCodec::new(self.proxy_id.clone(), self.registry.clone()));
        let writer = FramedWrite::new(write_half, PacketCodec::new(self.proxy_id.clone(), self.registry.clone()));
        tokio::spawn(read_packets(client, reader, events.clone()));
        tokio::spawn(write_packets(client, writer, packets));
        true
    }
}

async fn read_packets(
    client: ClientId,
    mut reader: FramedRead<OwnedReadHalf, PacketCodec>,
    events: mpsc::UnboundedSender<RouterEvent>,
) {
    while let Some(result) = reader.next().await {
        let event = match result {
            Ok(packet) => RouterEvent::ClientPacket { client, packet },
            Err(e) => {
                let _ = events.send(RouterEvent::ClientLost {
                    client,
                    error: e.to_string(),
                });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(RouterEvent::ClientDisconnected { client });
}

/// Ends when the router drops the client's sender or the socket fails
async fn write_packets(
    client: ClientId,
    mut writer: FramedWrite<OwnedWriteHalf, PacketCodec>,
    mut packets: mpsc::Receiver<OutgoingPacket>,
) {
    while let Some(packet) = packets.recv().await {
        match writer.send(packet).await {
            Ok(()) => {}
            Err(PacketError::Io(e)) => {
                warn!(%client, error = %e, "Client write failed, writer stopping");
                return;
            }
            Err(e) => error!(%client, error = %e, "Packet dropped"),
        }
    }
    debug!(%client, "Client writer stopped");
}

/// Doubles from [`ACCEPT_BACKOFF_MIN`] per consecutive failure, capped at [`ACCEPT_BACKOFF_MAX`]
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn registry() -> Arc<CommandRegistry> {
        Arc::new(CommandRegistry::with_builtins())
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let server = ClientServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), "qcProxy", registry())
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let first = ClientServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), "qcProxy", registry())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let err = ClientServer::bind(taken, "qcProxy", registry()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { addr, .. } if addr == taken));
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), Duration::from_secs(1));
        assert_eq!(accept_backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_client_queue_is_bounded() {
        let server = ClientServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), "qcProxy", registry())
            .await
            .unwrap()
            .with_queue_len(2);
        let addr = server.local_addr().unwrap();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _accept = server.spawn(event_tx);

        let _silent = TcpStream::connect(addr).await.unwrap();
        let Some(RouterEvent::ClientConnected { sender, .. }) = event_rx.recv().await else {
            panic!("expected a connection");
        };
        assert_eq!(sender.max_capacity(), 2);
    }

    #[tokio::test]
    async fn test_accepted_clients_get_distinct_ids() {
        let server = ClientServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), "qcProxy", registry())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _accept = server.spawn(event_tx);

        let first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            match event_rx.recv().await {
                Some(RouterEvent::ClientConnected { client, .. }) => ids.push(client),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(ids, vec![ClientId(1), ClientId(2)]);

        drop(first);
        assert!(matches!(
            event_rx.recv().await,
            Some(RouterEvent::ClientDisconnected { client: ClientId(1) })
        ));
        drop(second);
    }
}
