//! MOP Core - Shared types for the MOP daemon
//!
//! This crate provides the domain types shared between the frame
//! decoder (mop-protocol) and the daemon (mopd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod address;
pub mod error;
pub mod frame;
pub mod interface;
pub mod session;

// Re-exports for convenience
pub use address::HardwareAddr;
pub use error::{DomainError, DomainResult};
pub use frame::{Frame, Framing, MopVersion, ProtocolType};
pub use interface::{Interface, Suppression};
pub use session::{SessionId, SessionInfo, SessionState};
