//! Per-session reader and writer tasks.
//!
//! Each admitted session runs two tasks:
//! - [`ConnectionHandler`] reads lines, acknowledges them and relays them
//! - [`write_loop`] drains the session's outbound queue onto the socket
//!
//! Both stop when the session's cancellation token fires, which
//! [`SessionBroker::disconnect`] and [`SessionBroker::shutdown`] do. A peer
//! that closes its sending side is released instead: its writer flushes
//! whatever is still queued, acknowledgements included, before closing.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use mop_core::{SessionId, SessionInfo, SessionState};
use mop_protocol::{broadcast_line, parse_line, ClientLine, LineError, ACK_LINE, MAX_LINE_LENGTH};

use super::{CloseReason, SessionBroker};

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one read: a maximal line plus `\r\n`.
const READ_LIMIT: u64 = (MAX_LINE_LENGTH + 2) as u64;

/// Reader side of one session.
pub(crate) struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// This session's own outbound queue, used for acknowledgements
    outbound: mpsc::Sender<String>,

    broker: SessionBroker,
    info: SessionInfo,
    state: SessionState,
    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        outbound: mpsc::Sender<String>,
        broker: SessionBroker,
        info: SessionInfo,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            outbound,
            broker,
            info,
            state: SessionState::Accepted,
            cancel_token,
        }
    }

    /// Runs the session until the peer leaves, misbehaves, or is cancelled,
    /// then removes it from the broker.
    pub async fn run(mut self) {
        self.set_state(SessionState::Active).await;

        let result = self.message_loop().await;
        self.set_state(SessionState::Closing).await;

        let reason = match result {
            Ok(()) => {
                debug!(session_id = %self.info.id, "Peer closed connection");
                CloseReason::PeerClosed
            }
            Err(ConnectionError::Cancelled) if self.broker.is_shut_down() => CloseReason::Shutdown,
            Err(e @ (ConnectionError::LineTooLong { .. } | ConnectionError::InvalidUtf8)) => {
                warn!(session_id = %self.info.id, peer = %self.info.peer, error = %e, "Protocol error");
                e.close_reason()
            }
            Err(e) => {
                debug!(session_id = %self.info.id, error = %e, "Session ended");
                e.close_reason()
            }
        };

        match reason {
            CloseReason::PeerClosed => self.broker.release(self.info.id, reason).await,
            _ => self.broker.disconnect(self.info.id, reason).await,
        };
        self.set_state(SessionState::Closed).await;
        // dropping `self` drops the last sender the writer is waiting on
    }

    async fn message_loop(&mut self) -> Result<(), ConnectionError> {
        let cancel_token = self.cancel_token.clone();

        loop {
            let line = tokio::select! {
                _ = cancel_token.cancelled() => return Err(ConnectionError::Cancelled),
                line = self.read_line() => match line {
                    Ok(line) => line,
                    Err(ConnectionError::Eof) => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            let text = match line {
                ClientLine::Blank => {
                    trace!(session_id = %self.info.id, "Ignoring blank line");
                    continue;
                }
                ClientLine::Text(text) => text,
            };

            debug!(session_id = %self.info.id, len = text.len(), "Received line");

            self.enqueue(ACK_LINE.to_string(), &cancel_token).await?;

            let report = self
                .broker
                .relay(self.info.id, &broadcast_line(self.info.peer, &text))
                .await;
            trace!(
                session_id = %self.info.id,
                delivered = report.delivered,
                failed = report.failed.len(),
                "Relayed line"
            );
        }
    }

    /// Reads one line, bounded by [`READ_LIMIT`].
    async fn read_line(&mut self) -> Result<ClientLine, ConnectionError> {
        let mut buf = Vec::new();

        let bytes_read = (&mut self.reader)
            .take(READ_LIMIT)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if !buf.ends_with(b"\n") && bytes_read as u64 >= READ_LIMIT {
            return Err(ConnectionError::LineTooLong {
                size: buf.len(),
                max: MAX_LINE_LENGTH,
            });
        }

        parse_line(&buf).map_err(ConnectionError::from)
    }

    /// Queues a line to this session's own writer.
    async fn enqueue(
        &self,
        line: String,
        cancel_token: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        tokio::select! {
            _ = cancel_token.cancelled() => Err(ConnectionError::Cancelled),
            sent = self.outbound.send(line) => sent.map_err(|_| ConnectionError::WriterClosed),
        }
    }

    /// Advances the handler's state and mirrors it into the registry while
    /// the session is still registered.
    async fn set_state(&mut self, next: SessionState) {
        match self.state.transition(next) {
            Ok(state) => {
                trace!(session_id = %self.info.id, from = %self.state, to = %state, "Session state");
                self.state = state;
            }
            Err(e) => {
                warn!(session_id = %self.info.id, error = %e, "Ignoring state change");
                return;
            }
        }

        if let Some(Err(e)) = self.broker.set_session_state(self.info.id, next).await {
            warn!(session_id = %self.info.id, error = %e, "Registry state out of step");
        }
    }
}

/// Writer side of one session: drains `outbound` onto the socket.
///
/// Ends when the session is cancelled or when every sender is gone, in which
/// case everything queued has been written first. A failed or timed-out
/// write disconnects the session. The write half is shut down on exit so the
/// peer sees end of stream.
pub(crate) async fn write_loop(
    writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<String>,
    broker: SessionBroker,
    id: SessionId,
    cancel_token: CancellationToken,
) {
    let mut writer = BufWriter::new(writer);

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            next = outbound.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };

        if let Err(e) = write_line(&mut writer, &line).await {
            debug!(session_id = %id, error = %e, "Write failed");
            broker.disconnect(id, e.close_reason()).await;
            break;
        }
    }

    match timeout(WRITE_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(session_id = %id, error = %e, "Socket shutdown failed"),
        Err(_) => trace!(session_id = %id, "Socket shutdown timed out"),
    }
}

async fn write_line(
    writer: &mut BufWriter<OwnedWriteHalf>,
    line: &str,
) -> Result<(), ConnectionError> {
    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that end a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Eof,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Line too long: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Session writer closed")]
    WriterClosed,

    #[error("Session cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// How a session ending with this error is reported.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Eof => CloseReason::PeerClosed,
            Self::LineTooLong { .. } | Self::InvalidUtf8 => CloseReason::ProtocolError,
            Self::Io(_) | Self::WriteTimeout | Self::WriterClosed => CloseReason::Io,
            Self::Cancelled => CloseReason::Disconnected,
        }
    }
}

impl From<LineError> for ConnectionError {
    fn from(e: LineError) -> Self {
        match e {
            LineError::TooLong { len, max } => Self::LineTooLong { size: len, max },
            LineError::InvalidUtf8 => Self::InvalidUtf8,
        }
    }
}
