//! Connection: one physical client socket and the read loop that owns it.
//!
//! The read loop is the only reader. Writes from any task (heartbeat replies,
//! pushes, error frames) go through one async mutex around the sink, so at
//! most one write is in flight per socket.
//!
//! Close handling:
//!   read deadline expired  → grace close (close frame, then teardown)
//!   write deadline expired → grace close
//!   transport error        → hard close (teardown, no handshake)
//!   panic in frame logic   → hard close
//!
//! The first close wins. Later attempts, including concurrent ones from other
//! tasks, are no-ops. `after_closed` runs exactly once, from the read loop.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tether_core::config::ConnectionConfig;
use tether_core::wire::{self, Flag, Frame, WireError};
use tether_core::{Device, SessionId, Uid};

/// Transport-level message, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Outbound half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<TransportMessage, Error = TransportError> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("write deadline exceeded")]
    WriteTimeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("frame encoding failed: {0}")]
    Wire(#[from] WireError),
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this node (drain, keepalive sweep).
    Local,
    ReadTimeout,
    WriteTimeout,
    /// Peer sent a close or the stream ended.
    PeerClosed,
    Transport,
    Panic,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Local => "local",
            CloseReason::ReadTimeout => "read_timeout",
            CloseReason::WriteTimeout => "write_timeout",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Transport => "transport",
            CloseReason::Panic => "panic",
        };
        f.write_str(s)
    }
}

/// Callbacks invoked by the read loop.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// A `PING` frame arrived. The `PONG` reply is sent by the connection.
    async fn on_heartbeat(&self, conn: &Connection);

    /// A `DATA` frame arrived.
    async fn on_data(&self, conn: &Connection, payload: Bytes);

    /// The connection is closed and the read loop is about to exit.
    async fn after_closed(&self, conn: &Arc<Connection>, reason: CloseReason);
}

/// Identity of the client behind a socket, resolved before the socket is
/// wrapped.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: SessionId,
    pub uid: Uid,
    pub device: Device,
    pub ip: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl From<&ConnectionConfig> for ConnectionSettings {
    fn from(c: &ConnectionConfig) -> Self {
        Self {
            read_timeout: c.read_timeout(),
            write_timeout: c.write_timeout(),
            max_frame_bytes: c.max_frame_bytes,
        }
    }
}

pub struct Connection {
    info: ConnectionInfo,
    sink: Mutex<Option<FrameSink>>,
    /// Set exactly once, by whichever close runs first.
    closed: OnceLock<CloseReason>,
    cancel: CancellationToken,
    settings: ConnectionSettings,
    established_at: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.info.id)
            .field("uid", &self.info.uid)
            .field("device", &self.info.device)
            .field("closed", &self.closed.get())
            .finish()
    }
}

enum Flow {
    Continue,
    PeerClosed,
}

impl Connection {
    pub fn new(info: ConnectionInfo, sink: FrameSink, settings: ConnectionSettings) -> Arc<Self> {
        Arc::new(Self {
            info,
            sink: Mutex::new(Some(sink)),
            closed: OnceLock::new(),
            cancel: CancellationToken::new(),
            settings,
            established_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn uid(&self) -> Uid {
        self.info.uid
    }

    pub fn device(&self) -> Device {
        self.info.device
    }

    pub fn ip(&self) -> &str {
        &self.info.ip
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.get().copied()
    }

    /// Write one `DATA` frame.
    pub async fn push(&self, payload: Bytes) -> Result<(), ConnectionError> {
        self.send_frame(&Frame::data(payload)).await
    }

    /// Write one frame under the write deadline. A timed-out write grace-closes
    /// the connection; a transport failure hard-closes it.
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let bytes = frame.encode()?;

        let result = {
            let mut guard = self.sink.lock().await;
            let sink = guard.as_mut().ok_or(ConnectionError::Closed)?;
            tokio::time::timeout(
                self.settings.write_timeout,
                sink.send(TransportMessage::Binary(bytes)),
            )
            .await
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!(session_id = %self.info.id, error = %e, "write failed");
                self.hard_close(CloseReason::Transport).await;
                Err(ConnectionError::Transport(e))
            }
            Err(_) => {
                tracing::debug!(session_id = %self.info.id, "write deadline exceeded");
                self.grace_close(CloseReason::WriteTimeout).await;
                Err(ConnectionError::WriteTimeout)
            }
        }
    }

    /// Close from outside the read loop (drain, keepalive sweep).
    pub async fn close(&self) -> bool {
        self.grace_close(CloseReason::Local).await
    }

    /// Attempt a close frame, then tear down. Returns false if already closed.
    pub async fn grace_close(&self, reason: CloseReason) -> bool {
        if self.closed.set(reason).is_err() {
            return false;
        }
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let handshake = async {
                sink.send(TransportMessage::Close).await?;
                sink.close().await
            };
            if let Err(e) = tokio::time::timeout(self.settings.write_timeout, handshake)
                .await
                .unwrap_or_else(|_| Err(TransportError("close handshake timed out".into())))
            {
                tracing::debug!(session_id = %self.info.id, error = %e, "close handshake failed");
            }
        }
        self.cancel.cancel();
        tracing::debug!(session_id = %self.info.id, %reason, "connection grace-closed");
        true
    }

    /// Tear down without a close frame. Returns false if already closed.
    pub async fn hard_close(&self, reason: CloseReason) -> bool {
        if self.closed.set(reason).is_err() {
            return false;
        }
        drop(self.sink.lock().await.take());
        self.cancel.cancel();
        tracing::debug!(session_id = %self.info.id, %reason, "connection hard-closed");
        true
    }

    /// Run the read loop until the connection closes. Returns why it closed.
    pub async fn serve<R>(self: Arc<Self>, mut reader: R, handler: Arc<dyn ConnectionHandler>) -> CloseReason
    where
        R: Stream<Item = Result<TransportMessage, TransportError>> + Unpin + Send,
    {
        let reason = loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => {
                    break self.close_reason().unwrap_or(CloseReason::Local);
                }
                next = tokio::time::timeout(self.settings.read_timeout, reader.next()) => next,
            };

            let msg = match next {
                Err(_) => {
                    // The transport's read state is undefined after a deadline.
                    self.grace_close(CloseReason::ReadTimeout).await;
                    break CloseReason::ReadTimeout;
                }
                Ok(None) => {
                    self.hard_close(CloseReason::PeerClosed).await;
                    break CloseReason::PeerClosed;
                }
                Ok(Some(Err(e))) => {
                    tracing::debug!(session_id = %self.info.id, error = %e, "read failed");
                    self.hard_close(CloseReason::Transport).await;
                    break CloseReason::Transport;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            let outcome = AssertUnwindSafe(self.handle_message(msg, handler.as_ref()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Flow::Continue) => {}
                Ok(Flow::PeerClosed) => {
                    self.hard_close(CloseReason::PeerClosed).await;
                    break CloseReason::PeerClosed;
                }
                Err(_) => {
                    tracing::error!(session_id = %self.info.id, "panic while handling frame");
                    self.hard_close(CloseReason::Panic).await;
                    break CloseReason::Panic;
                }
            }

            if let Some(reason) = self.close_reason() {
                break reason;
            }
        };

        drop(reader);
        handler.after_closed(&self, reason).await;
        reason
    }

    async fn handle_message(&self, msg: TransportMessage, handler: &dyn ConnectionHandler) -> Flow {
        match msg {
            TransportMessage::Binary(bytes) => {
                match wire::decode_with_limit(bytes, self.settings.max_frame_bytes) {
                    Ok(frame) => match frame.flag() {
                        Flag::Ping => {
                            handler.on_heartbeat(self).await;
                            self.reply(Frame::pong()).await;
                        }
                        Flag::Data => handler.on_data(self, frame.payload).await,
                        other => {
                            self.reject(format!("flag {other:?} may not be sent by clients"))
                                .await
                        }
                    },
                    Err(e) => self.reject(e.to_string()).await,
                }
            }
            TransportMessage::Text(_) => self.reject("text frames are not supported".into()).await,
            // Answered by the transport library.
            TransportMessage::Ping(_) | TransportMessage::Pong(_) => {}
            TransportMessage::Close => return Flow::PeerClosed,
        }
        Flow::Continue
    }

    /// Soft protocol violation: answer with ERR, keep the connection.
    async fn reject(&self, msg: String) {
        tracing::debug!(session_id = %self.info.id, reason = %msg, "protocol violation");
        self.reply(Frame::error(msg)).await;
    }

    async fn reply(&self, frame: Frame) {
        if let Err(e) = self.send_frame(&frame).await {
            tracing::debug!(session_id = %self.info.id, error = %e, "reply not sent");
        }
    }
}
