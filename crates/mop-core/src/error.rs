//! Domain-specific error types following panic-free policy.

use crate::SessionState;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Hardware address text could not be parsed
    #[error("Invalid hardware address: {value} (expected six hex octets like 08:00:2b:01:02:03)")]
    InvalidHardwareAddr { value: String },

    /// Both protocol-version suppressions were requested
    #[error("MOP V3 and V4 suppression are mutually exclusive")]
    ConflictingSuppression,

    /// Interface name is empty or unusable
    #[error("Invalid interface name: {name:?}")]
    InvalidInterfaceName { name: String },

    /// Session lifecycle moved backwards
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
