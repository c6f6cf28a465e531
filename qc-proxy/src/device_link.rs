//! The device side of the proxy
//!
//! One reader task turns the device byte stream into [`RouterEvent::DeviceLine`]
//! events; one writer task drains the router's outgoing lines. Either task
//! ending does not stop the other, and the proxy never reconnects.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use qc_protocol::LineCodec;

use crate::router::RouterEvent;

/// Reader and writer tasks over one device stream; aborted on drop
#[derive(Debug)]
pub struct DeviceLink {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl DeviceLink {
    /// Split `stream` and spawn both tasks
    ///
    /// Lines longer than `max_line_length` are discarded. Must be called from
    /// within a tokio runtime.
    pub fn spawn<S>(
        stream: S,
        max_line_length: usize,
        events: mpsc::UnboundedSender<RouterEvent>,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, LineCodec::with_max_length(max_line_length));
        let writer = FramedWrite::new(write_half, LineCodec::with_max_length(max_line_length));

        Self {
            reader: tokio::spawn(read_lines(reader, events)),
            writer: tokio::spawn(write_lines(writer, lines)),
        }
    }

    /// Whether both tasks have ended
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.writer.is_finished()
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_lines<R>(mut reader: FramedRead<R, LineCodec>, events: mpsc::UnboundedSender<RouterEvent>)
where
    R: AsyncRead + Unpin,
{
    info!("Device reader started");
    while let Some(result) = reader.next().await {
        match result {
            Ok(line) => {
                if events.send(RouterEvent::DeviceLine(line)).is_err() {
                    debug!("Router gone, device reader stopping");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Device read failed");
                break;
            }
        }
    }
    info!("Device stream closed");
    let _ = events.send(RouterEvent::DeviceLost);
}

async fn write_lines<W>(mut writer: FramedWrite<W, LineCodec>, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        if let Err(e) = writer.send(line).await {
            warn!(error = %e, "Device write failed, writer stopping");
            return;
        }
    }
    debug!("Device line channel closed, writer stopping");
}
