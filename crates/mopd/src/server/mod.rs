//! TCP session broker.
//!
//! The broker:
//! - Listens on a TCP socket for client connections
//! - Admits connections up to `max_sessions`, rejecting the rest with a notice
//! - Relays each client line to every other live session
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  SessionBroker  │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   SessionSet    │
//! │  (per session)  │     │ (RwLock<Map>)   │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ relay: snapshot, try_send
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │  write_loop     │
//!                         │ (per session)   │
//!                         └─────────────────┘
//! ```
//!
//! Every session owns a bounded outbound queue drained by its own writer
//! task. Relay only enqueues, so a stalled peer never stalls the sender,
//! other peers, or the accept loop. A peer whose queue is full or gone is
//! evicted after the relay pass.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Per-session errors are logged and close only that session

mod connection;
mod sessions;

pub use connection::ConnectionError;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mop_core::{DomainResult, SessionId, SessionInfo, SessionState};
use mop_protocol::{CAPACITY_NOTICE, SHUTDOWN_NOTICE};

use crate::config::ServerConfig;
use connection::ConnectionHandler;
use sessions::SessionSet;

/// Lines queued per session before relay counts it as a delivery failure.
pub const OUTBOUND_BUFFER: usize = 256;

/// Lower bound for the listen backlog.
const MIN_BACKLOG: usize = 5;

/// Capacity of the broker event channel.
const EVENT_BUFFER: usize = 100;

/// How long a rejected connection gets to receive the capacity notice.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed `accept()` (e.g. descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ============================================================================
// Broker
// ============================================================================

/// Handle to the session broker.
///
/// Cheap to clone; every clone refers to the same listener state and
/// session set.
#[derive(Clone)]
pub struct SessionBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: ServerConfig,

    /// Sent to newly admitted sessions; reloadable at runtime
    welcome_message: RwLock<String>,

    sessions: SessionSet,

    /// Root token; every session runs under a child of it
    cancel_token: CancellationToken,

    events: broadcast::Sender<BrokerEvent>,

    local_addr: OnceLock<SocketAddr>,
}

impl SessionBroker {
    /// Creates a broker. Nothing is bound until [`SessionBroker::bind`].
    pub fn new(config: ServerConfig, cancel_token: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let welcome_message = RwLock::new(config.welcome_message.clone());
        let sessions = SessionSet::new(config.max_sessions);

        Self {
            inner: Arc::new(BrokerInner {
                config,
                welcome_message,
                sessions,
                cancel_token,
                events,
                local_addr: OnceLock::new(),
            }),
        }
    }

    /// Resolves the configured host and binds the listening socket.
    ///
    /// # Errors
    ///
    /// `BrokerError::Resolve` if the host does not resolve,
    /// `BrokerError::Bind` if the socket cannot be bound or put in listen mode.
    pub async fn bind(&self) -> Result<TcpListener, BrokerError> {
        let host = self.inner.config.host.as_str();
        let port = self.inner.config.port;
        let display = format!("{host}:{port}");

        let addr = lookup_host((host, port))
            .await
            .map_err(|e| BrokerError::Resolve {
                addr: display.clone(),
                error: e.to_string(),
            })?
            .next()
            .ok_or_else(|| BrokerError::Resolve {
                addr: display.clone(),
                error: "no addresses found".to_string(),
            })?;

        let bind_error = |e: std::io::Error| BrokerError::Bind {
            addr,
            error: e.to_string(),
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;

        let backlog = self.inner.config.max_sessions.max(MIN_BACKLOG);
        let listener = socket
            .listen(u32::try_from(backlog).unwrap_or(u32::MAX))
            .map_err(bind_error)?;

        if let Ok(local) = listener.local_addr() {
            let _ = self.inner.local_addr.set(local);
        }
        Ok(listener)
    }

    /// Binds and runs until shutdown.
    pub async fn serve(&self) -> Result<(), BrokerError> {
        let listener = self.bind().await?;
        self.run(listener).await;
        Ok(())
    }

    /// Runs the accept loop on `listener`.
    ///
    /// Admissions are handled one at a time. Returns after the cancellation
    /// token fires; the listener is closed and every session shut down by
    /// then.
    pub async fn run(&self, listener: TcpListener) {
        if let Ok(local) = listener.local_addr() {
            let _ = self.inner.local_addr.set(local);
        }

        info!(
            addr = ?self.local_addr(),
            max_sessions = self.max_sessions(),
            "Session broker listening"
        );

        loop {
            tokio::select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!("Broker shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            self.accept(stream, peer).await;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        drop(listener);
        self.shutdown().await;
    }

    /// Admits or rejects one accepted connection.
    ///
    /// On admission the session's reader and writer tasks are spawned and
    /// the welcome line is the first thing queued to it. On rejection the
    /// capacity notice is written from a separate task so a slow peer cannot
    /// hold up the accept loop.
    pub async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Admission {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        // Fresh queue, cannot be full; queued before admission so no relayed
        // line can overtake it.
        let _ = outbound_tx.try_send(self.welcome_message().await);

        let session_token = self.inner.cancel_token.child_token();
        let admitted = self
            .inner
            .sessions
            .admit(peer, outbound_tx.clone(), session_token.clone())
            .await;

        match admitted {
            Ok(info) => {
                let id = info.id;
                let sessions = self.session_count().await;
                info!(session_id = %id, peer = %peer, sessions, "Session admitted");
                let _ = self.inner.events.send(BrokerEvent::Admitted { id, peer });

                let (reader, writer) = stream.into_split();
                tokio::spawn(connection::write_loop(
                    writer,
                    outbound_rx,
                    self.clone(),
                    id,
                    session_token.clone(),
                ));

                let handler =
                    ConnectionHandler::new(reader, outbound_tx, self.clone(), info, session_token);
                tokio::spawn(handler.run());

                Admission::Admitted(id)
            }
            Err(reason) => {
                info!(peer = %peer, reason = %reason, "Connection rejected");
                let _ = self.inner.events.send(BrokerEvent::Rejected {
                    peer,
                    reason: reason.clone(),
                });
                tokio::spawn(send_rejection(stream, peer, reason.notice()));
                Admission::Rejected(reason)
            }
        }
    }

    /// Delivers `line` to every live session except `sender`.
    ///
    /// Works on a snapshot of the session set; no lock is held while
    /// enqueueing. Sessions that cannot take the line are disconnected once
    /// the pass is over.
    pub async fn relay(&self, sender: SessionId, line: &str) -> RelayReport {
        let recipients = self.inner.sessions.recipients(sender).await;
        let mut report = RelayReport::default();

        for (id, outbound) in recipients {
            match outbound.try_send(line.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %id, "Outbound queue full, dropping session");
                    report.failed.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id = %id, "Session writer gone during relay");
                    report.failed.push(id);
                }
            }
        }

        for id in &report.failed {
            self.disconnect(*id, CloseReason::DeliveryFailed).await;
        }

        report
    }

    /// Closes a session and removes it from the set.
    ///
    /// Returns `false` if the session was already gone; a second call has no
    /// further effect and emits no second close event.
    pub async fn disconnect(&self, id: SessionId, reason: CloseReason) -> bool {
        self.close_session(id, reason, true).await
    }

    /// Removes a session without cancelling its tasks.
    ///
    /// The writer keeps running until every line already queued to the
    /// session is on the wire, then ends once the last sender is dropped.
    pub(crate) async fn release(&self, id: SessionId, reason: CloseReason) -> bool {
        self.close_session(id, reason, false).await
    }

    async fn close_session(&self, id: SessionId, reason: CloseReason, cancel_tasks: bool) -> bool {
        let Some(entry) = self.inner.sessions.remove(id).await else {
            debug!(session_id = %id, "Session already closed");
            return false;
        };

        if cancel_tasks {
            entry.cancel_token.cancel();
        }
        info!(
            session_id = %id,
            peer = %entry.info.peer,
            reason = %reason,
            duration_secs = entry.info.age_secs(),
            "Session closed"
        );
        let _ = self.inner.events.send(BrokerEvent::Closed {
            id,
            peer: entry.info.peer,
            reason,
        });
        true
    }

    /// Stops the accept loop and closes every session.
    ///
    /// Safe to call from any task and more than once. No connection is
    /// admitted afterwards.
    pub async fn shutdown(&self) {
        self.inner.cancel_token.cancel();

        let entries = self.inner.sessions.close_all().await;
        if entries.is_empty() {
            return;
        }

        info!(sessions = entries.len(), "Closing all sessions");
        for entry in entries {
            entry.cancel_token.cancel();
            let _ = self.inner.events.send(BrokerEvent::Closed {
                id: entry.info.id,
                peer: entry.info.peer,
                reason: CloseReason::Shutdown,
            });
        }
    }

    /// Records a session's lifecycle state in the registry.
    ///
    /// `None` once the session has been removed.
    pub(crate) async fn set_session_state(
        &self,
        id: SessionId,
        next: SessionState,
    ) -> Option<DomainResult<SessionState>> {
        self.inner.sessions.set_state(id, next).await
    }

    /// True once shutdown has begun.
    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    /// Subscribes to admission and close events.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.len().await
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions().await.into_iter().map(|info| info.id).collect()
    }

    /// Snapshot of live sessions, ordered by id.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.sessions.infos().await
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.inner.sessions.contains(id).await
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.sessions.max_sessions()
    }

    /// Address the listener is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub async fn welcome_message(&self) -> String {
        self.inner.welcome_message.read().await.clone()
    }

    /// Replaces the welcome line. Sessions already admitted are unaffected.
    pub async fn set_welcome_message(&self, message: impl Into<String>) {
        *self.inner.welcome_message.write().await = message.into();
    }
}

impl fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBroker")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("max_sessions", &self.inner.config.max_sessions)
            .finish_non_exhaustive()
    }
}

/// Writes `notice` to a rejected connection and closes it.
async fn send_rejection(mut stream: TcpStream, peer: SocketAddr, notice: &str) {
    let notice = format!("{notice}\n");

    let result = timeout(REJECT_WRITE_TIMEOUT, async {
        stream.write_all(notice.as_bytes()).await?;
        stream.shutdown().await
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Failed to send rejection notice"),
        Err(_) => debug!(peer = %peer, "Timed out sending rejection notice"),
    }
}

// ============================================================================
// Results and Events
// ============================================================================

/// Outcome of [`SessionBroker::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(SessionId),
    Rejected(AdmissionError),
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Sessions the line was queued to
    pub delivered: usize,
    /// Sessions that could not take the line and were disconnected
    pub failed: Vec<SessionId>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The peer closed its side
    PeerClosed,
    /// Over-long line or invalid UTF-8
    ProtocolError,
    /// Read or write failure on the socket
    Io,
    /// Outbound queue full or closed during relay
    DeliveryFailed,
    /// Closed through [`SessionBroker::disconnect`]
    Disconnected,
    /// Broker shutdown
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer closed",
            Self::ProtocolError => "protocol error",
            Self::Io => "I/O error",
            Self::DeliveryFailed => "delivery failed",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Broker lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Admitted {
        id: SessionId,
        peer: SocketAddr,
    },
    Rejected {
        peer: SocketAddr,
        reason: AdmissionError,
    },
    Closed {
        id: SessionId,
        peer: SocketAddr,
        reason: CloseReason,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Why a connection was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Session limit reached (max: {max})")]
    Full { max: usize },

    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    /// Line sent to the turned-away peer before its connection is closed.
    pub fn notice(&self) -> &'static str {
        match self {
            Self::Full { .. } => CAPACITY_NOTICE,
            Self::ShuttingDown => SHUTDOWN_NOTICE,
        }
    }
}

/// Broker startup errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to resolve {addr}: {error}")]
    Resolve { addr: String, error: String },

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },
}
