//! Session identifiers and lifecycle.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;

use crate::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for an accepted client session.
///
/// Assigned from a monotonically increasing counter, never reused within
/// one broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a session.
///
/// ```text
/// Accepted ──▶ Active ──▶ Closing ──▶ Closed
///     │                      ▲
///     └──────────────────────┘
/// ```
///
/// `Closed` is terminal and nothing returns to `Active` after `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Accepted,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Accepted, Active) | (Accepted, Closing) | (Active, Closing) | (Closing, Closed)
        )
    }

    /// Returns the next state, or an error if the move is not allowed.
    pub fn transition(self, next: SessionState) -> DomainResult<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// True while the session may send and receive.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Accepted | Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accepted => "accepted",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Read-only view of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
}

impl SessionInfo {
    /// Seconds since the session was admitted.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.connected_at).num_seconds()
    }
}
