//! The live-session registry.
//!
//! Every mutation happens under one write-lock acquisition, which makes the
//! capacity check and the insert atomic. Readers take point-in-time
//! snapshots so no lock is held while talking to peers.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Lookups of absent sessions return `None`, never fail

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use mop_core::{DomainResult, SessionId, SessionInfo, SessionState};

use super::AdmissionError;

/// Registry entry for one admitted session.
#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub info: SessionInfo,
    /// Queue drained by the session's writer task
    pub outbound: mpsc::Sender<String>,
    /// Cancels the session's reader and writer tasks
    pub cancel_token: CancellationToken,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<SessionId, SessionEntry>,
    /// Set once by shutdown; no admission succeeds afterwards
    closed: bool,
}

/// Capacity-bounded map of live sessions.
#[derive(Debug)]
pub(crate) struct SessionSet {
    table: RwLock<SessionTable>,
    max_sessions: usize,
    next_id: AtomicU64,
}

impl SessionSet {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            table: RwLock::new(SessionTable::default()),
            max_sessions,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Registers a new session if there is room.
    ///
    /// # Errors
    ///
    /// `AdmissionError::Full` at capacity, `AdmissionError::ShuttingDown`
    /// after [`SessionSet::close_all`].
    pub async fn admit(
        &self,
        peer: SocketAddr,
        outbound: mpsc::Sender<String>,
        cancel_token: CancellationToken,
    ) -> Result<SessionInfo, AdmissionError> {
        let mut table = self.table.write().await;

        if table.closed {
            return Err(AdmissionError::ShuttingDown);
        }
        if table.sessions.len() >= self.max_sessions {
            return Err(AdmissionError::Full {
                max: self.max_sessions,
            });
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = SessionInfo {
            id,
            peer,
            connected_at: Utc::now(),
            state: SessionState::Accepted,
        };
        table.sessions.insert(
            id,
            SessionEntry {
                info: info.clone(),
                outbound,
                cancel_token,
            },
        );

        Ok(info)
    }

    /// Removes a session, returning its entry if it was present.
    pub async fn remove(&self, id: SessionId) -> Option<SessionEntry> {
        self.table.write().await.sessions.remove(&id)
    }

    /// Moves a registered session to `next`.
    ///
    /// Returns `None` once the session has left the set.
    pub async fn set_state(
        &self,
        id: SessionId,
        next: SessionState,
    ) -> Option<DomainResult<SessionState>> {
        let mut table = self.table.write().await;
        let entry = table.sessions.get_mut(&id)?;
        Some(entry.info.state.transition(next).map(|state| {
            entry.info.state = state;
            state
        }))
    }

    /// Snapshot of the outbound queue of every live session except `exclude`.
    ///
    /// Sessions already in `Closing` receive nothing further.
    pub async fn recipients(&self, exclude: SessionId) -> Vec<(SessionId, mpsc::Sender<String>)> {
        self.table
            .read()
            .await
            .sessions
            .iter()
            .filter(|(id, entry)| **id != exclude && entry.info.state.is_live())
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect()
    }

    /// Marks the set closed and takes every entry out of it.
    pub async fn close_all(&self) -> Vec<SessionEntry> {
        let mut table = self.table.write().await;
        table.closed = true;
        table.sessions.drain().map(|(_, entry)| entry).collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.sessions.len()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.table.read().await.sessions.contains_key(&id)
    }

    /// Snapshot of all sessions, ordered by id.
    pub async fn infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .table
            .read()
            .await
            .sessions
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
