//! Socket pumps for one agent connection.
//!
//! A transport owns the two halves of a WebSocket and runs:
//!
//! - a **reader** that decodes binary messages onto `recv`, extending its
//!   deadline by `pong_wait` on every pong;
//! - a **writer** that multiplexes `control` (preferred), `send` and a ping
//!   ticker, bounding every write by `write_wait`.
//!
//! Both pumps share one [`CancellationToken`]. Either pump exiting cancels
//! it, so a failure on one side tears down the other.

use std::fmt::Display;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionError;
use crate::config::WebSocketConfig;
use crate::metrics;
use crate::protocol::{self, Message};

/// How long a cancelled writer keeps flushing already-queued messages.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub buffer_size: usize,
}

impl From<&WebSocketConfig> for TransportSettings {
    fn from(cfg: &WebSocketConfig) -> Self {
        Self {
            write_wait: cfg.write_wait(),
            pong_wait: cfg.pong_wait(),
            ping_period: cfg.ping_period(),
            max_message_size: cfg.max_message_size,
            buffer_size: cfg.channel_buffer_size,
        }
    }
}

/// Channel ends of a running transport.
pub struct Transport {
    /// Outbound work, written after anything queued on `control_tx`.
    pub send_tx: mpsc::Sender<Message>,
    /// Handshake and admin replies that bypass queued work.
    pub control_tx: mpsc::Sender<Message>,
    /// Posting an error here makes the writer close the socket.
    pub error_tx: mpsc::Sender<SessionError>,
    /// Decoded inbound messages in arrival order. Closed when the reader exits.
    pub recv_rx: mpsc::Receiver<Message>,
    pub cancel: CancellationToken,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl Transport {
    /// Spawn reader and writer tasks over the two socket halves.
    pub fn spawn<Si, St, E>(
        sink: Si,
        stream: St,
        settings: &TransportSettings,
        cancel: CancellationToken,
    ) -> Self
    where
        Si: Sink<WsMessage> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<WsMessage, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let buffer = settings.buffer_size.max(1);
        let (send_tx, send_rx) = mpsc::channel(buffer);
        let (control_tx, control_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (recv_tx, recv_rx) = mpsc::channel(buffer);

        let reader = tokio::spawn(read_pump(
            stream,
            recv_tx,
            cancel.clone(),
            settings.pong_wait,
            settings.max_message_size,
        ));
        let writer = tokio::spawn(write_pump(
            sink,
            WriterChannels {
                control_rx,
                send_rx,
                error_rx,
            },
            cancel.clone(),
            settings.write_wait,
            settings.ping_period,
        ));

        Self {
            send_tx,
            control_tx,
            error_tx,
            recv_rx,
            cancel,
            reader,
            writer,
        }
    }
}

pub(crate) async fn read_pump<St, E>(
    mut stream: St,
    recv_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    pong_wait: Duration,
    max_message_size: usize,
) where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = tokio::time::timeout_at(deadline, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                warn!("Read deadline exceeded, no pong from peer");
                break;
            }
            Ok(None) => {
                debug!("Peer closed the socket");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "WebSocket read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Binary(bytes) => {
                let mut cursor: &[u8] = &bytes;
                let msg = match protocol::read_message_limited(&mut cursor, max_message_size) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "Unable to decode message from peer");
                        break;
                    }
                };
                metrics::message_received(msg.kind());
                tokio::select! {
                    () = cancel.cancelled() => break,
                    sent = recv_tx.send(msg) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            WsMessage::Pong(_) => {
                deadline = Instant::now() + pong_wait;
            }
            WsMessage::Close(_) => {
                debug!("Received close frame");
                break;
            }
            WsMessage::Ping(_) => {}
            WsMessage::Text(_) => {
                warn!("Ignoring text message, the protocol is binary only");
            }
        }
    }

    cancel.cancel();
}

pub(crate) struct WriterChannels {
    pub control_rx: mpsc::Receiver<Message>,
    pub send_rx: mpsc::Receiver<Message>,
    pub error_rx: mpsc::Receiver<SessionError>,
}

pub(crate) async fn write_pump<Si>(
    mut sink: Si,
    mut channels: WriterChannels,
    cancel: CancellationToken,
    write_wait: Duration,
    ping_period: Duration,
) where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    let mut ping_ticker = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
    let mut drain = false;

    loop {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                drain = true;
                break;
            }
            Some(err) = channels.error_rx.recv() => {
                warn!(error = %err, "Closing connection");
                break;
            }
            Some(msg) = channels.control_rx.recv() => write_message(&mut sink, &msg, write_wait).await,
            Some(msg) = channels.send_rx.recv() => write_message(&mut sink, &msg, write_wait).await,
            _ = ping_ticker.tick() => {
                write_frame(&mut sink, WsMessage::Ping(Bytes::new()), write_wait).await
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "WebSocket write failed");
            break;
        }
    }

    if drain {
        drain_queued(&mut sink, &mut channels, write_wait).await;
    }

    let _ = tokio::time::timeout(write_wait, sink.send(WsMessage::Close(None))).await;
    let _ = tokio::time::timeout(write_wait, sink.close()).await;
    cancel.cancel();
}

/// Flush what was queued before cancellation, bounded by [`DRAIN_WAIT`].
async fn drain_queued<Si>(sink: &mut Si, channels: &mut WriterChannels, write_wait: Duration)
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    let deadline = Instant::now() + DRAIN_WAIT;
    while Instant::now() < deadline {
        let msg = match channels.control_rx.try_recv() {
            Ok(msg) => msg,
            Err(_) => match channels.send_rx.try_recv() {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if write_message(sink, &msg, write_wait.min(remaining)).await.is_err() {
            return;
        }
    }
}

async fn write_message<Si>(
    sink: &mut Si,
    msg: &Message,
    write_wait: Duration,
) -> Result<(), SessionError>
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    let bytes = protocol::encode(msg)?;
    write_frame(sink, WsMessage::Binary(bytes.into()), write_wait).await?;
    metrics::message_sent(msg.kind());
    Ok(())
}

async fn write_frame<Si>(sink: &mut Si, frame: WsMessage, write_wait: Duration) -> Result<(), SessionError>
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: Display,
{
    match tokio::time::timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::WebSocket(e.to_string())),
        Err(_) => Err(SessionError::WriteTimeout),
    }
}
