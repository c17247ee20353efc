//! MOP Protocol - wire formats used by the daemon
//!
//! This crate provides:
//! - `frame` - decoding raw link-layer bytes into tagged [`mop_core::Frame`]s
//! - `message` - the line-oriented text protocol spoken to session clients

pub mod frame;
pub mod message;

pub use frame::{decode_frame, FrameError, ETHER_HEADER_LEN};
pub use message::{
    broadcast_line, parse_line, ClientLine, LineError, ACK_LINE, CAPACITY_NOTICE,
    DEFAULT_WELCOME_MESSAGE, MAX_LINE_LENGTH, SHUTDOWN_NOTICE,
};
