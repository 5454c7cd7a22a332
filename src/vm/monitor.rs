//! Monitor protocol client over TCP.
//!
//! ```text
//! connect(port) ─► read greeting {"QMP": …}
//!               ─► send qmp_capabilities ─► wait for {"return": …}
//!               ─► reader task: events → sink, replies → log
//! send(cmd)     ─► write CRLF-terminated JSON on the write half
//! ```
//!
//! There is no automatic reconnect. A lost channel stays lost until the next
//! session creates a new client.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::vm::qmp::{FrameDecoder, FrameError, QmpCommand, QmpEvent, QmpMessage};

/// Receives asynchronous events from the reader task.
pub type EventSink = Arc<dyn Fn(QmpEvent) + Send + Sync>;

/// Bound on the greeting + capabilities exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A negotiated monitor channel.
pub struct MonitorClient {
    port: u16,
    writer: Option<OwnedWriteHalf>,
    reader: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorClient")
            .field("port", &self.port)
            .field("open", &self.is_open())
            .finish()
    }
}

impl MonitorClient {
    /// Connect to the engine's monitor on `localhost:<port>` and negotiate.
    pub async fn connect(port: u16, sink: EventSink) -> Result<Self, MonitorError> {
        let stream = TcpStream::connect(("localhost", port))
            .await
            .map_err(|source| MonitorError::Connection { port, source })?;
        let _ = stream.set_nodelay(true);
        let (mut read, mut write) = stream.into_split();
        let mut decoder = FrameDecoder::new();

        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake(&mut read, &mut write, &mut decoder),
        )
        .await
        .map_err(|_| MonitorError::Handshake("timed out".into()))??;

        info!(port, "monitor channel negotiated");
        let reader = tokio::spawn(read_loop(port, read, decoder, sink));

        Ok(Self {
            port,
            writer: Some(write),
            reader: Some(reader),
        })
    }

    /// Connect with retries while the engine's listener comes up.
    ///
    /// Only refused/failed connects are retried; a peer that accepts but
    /// fails the handshake is reported at once.
    pub async fn connect_with_retry(
        port: u16,
        attempts: u32,
        backoff: Duration,
        sink: EventSink,
    ) -> Result<Self, MonitorError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(port, Arc::clone(&sink)).await {
                Ok(client) => {
                    debug!(port, attempt, "monitor ready");
                    return Ok(client);
                }
                Err(MonitorError::Connection { .. }) if attempt < attempts => {
                    let wait = (backoff * attempt).min(Duration::from_secs(1));
                    debug!(port, attempt, wait_ms = wait.as_millis() as u64, "monitor not ready yet");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Write one command. Does not wait for the reply.
    pub async fn send(&mut self, command: &QmpCommand) -> Result<(), MonitorError> {
        let writer = self.writer.as_mut().ok_or(MonitorError::Closed)?;
        let wire = command.to_wire();
        writer
            .write_all(wire.as_bytes())
            .await
            .map_err(|e| MonitorError::Send(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| MonitorError::Send(e.to_string()))?;
        debug!(port = self.port, command = command.name(), "monitor command sent");
        Ok(())
    }

    /// Shut the socket down. Further sends fail with [`MonitorError::Closed`];
    /// the reader task ends when the client is dropped.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
            debug!(port = self.port, "monitor channel closed");
        }
    }
}

impl Drop for MonitorClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Wire helpers
// ---------------------------------------------------------------------------

async fn handshake(
    read: &mut OwnedReadHalf,
    write: &mut OwnedWriteHalf,
    decoder: &mut FrameDecoder,
) -> Result<(), MonitorError> {
    match next_message(read, decoder).await? {
        QmpMessage::Greeting(_) => {}
        other => {
            return Err(MonitorError::Handshake(format!(
                "unexpected greeting: {other:?}"
            )));
        }
    }

    write
        .write_all(QmpCommand::Capabilities.to_wire().as_bytes())
        .await
        .map_err(|e| MonitorError::Handshake(e.to_string()))?;

    loop {
        match next_message(read, decoder).await? {
            QmpMessage::Return(_) => return Ok(()),
            QmpMessage::Error { class, desc } => {
                return Err(MonitorError::Handshake(format!("{class}: {desc}")));
            }
            // Events may arrive before the capabilities reply.
            _ => {}
        }
    }
}

async fn next_message(
    read: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> Result<QmpMessage, MonitorError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = decoder.next_frame() {
            return frame
                .map(QmpMessage::from_value)
                .map_err(|e| MonitorError::Handshake(e.to_string()));
        }
        let n = read
            .read(&mut chunk)
            .await
            .map_err(|e| MonitorError::Handshake(e.to_string()))?;
        if n == 0 {
            return Err(MonitorError::Handshake("connection closed by peer".into()));
        }
        decoder.push(&chunk[..n]);
    }
}

/// Forward events until the socket closes. A malformed frame is logged and
/// skipped; only EOF, a read error or an oversized frame end the loop.
async fn read_loop(port: u16, mut read: OwnedReadHalf, mut decoder: FrameDecoder, sink: EventSink) {
    let mut chunk = [0u8; 4096];
    loop {
        while let Some(frame) = decoder.next_frame() {
            match frame {
                Ok(value) => dispatch(port, QmpMessage::from_value(value), &sink),
                Err(FrameError::Malformed(e)) => {
                    warn!(port, error = %e, "skipping malformed monitor frame");
                }
                Err(e @ FrameError::TooLarge) => {
                    warn!(port, error = %e, "monitor reader finished");
                    return;
                }
            }
        }
        match read.read(&mut chunk).await {
            Ok(0) => {
                debug!(port, "monitor closed by peer");
                return;
            }
            Ok(n) => decoder.push(&chunk[..n]),
            Err(e) => {
                debug!(port, error = %e, "monitor reader finished");
                return;
            }
        }
    }
}

fn dispatch(port: u16, message: QmpMessage, sink: &EventSink) {
    match message {
        QmpMessage::Event(event) => {
            info!(port, event = %event.name, "monitor event");
            sink(event);
        }
        QmpMessage::Return(_) => debug!(port, "monitor command acknowledged"),
        QmpMessage::Error { class, desc } => {
            warn!(port, class = %class, desc = %desc, "monitor command rejected");
        }
        other => debug!(port, message = ?other, "unhandled monitor message"),
    }
}
