//! Line-oriented session protocol.
//!
//! Every message is one UTF-8 line terminated by `\n` (a preceding `\r` is
//! tolerated). The server speaks first:
//!
//! ```text
//! S: Welcome to MOP-D Service
//! C: hello
//! S: Message received
//! ```
//!
//! and every other connected client sees `127.0.0.1:50312: hello`.

use std::net::SocketAddr;

use thiserror::Error;

/// Welcome line sent on admission unless configured otherwise.
pub const DEFAULT_WELCOME_MESSAGE: &str = "Welcome to MOP-D Service";

/// Acknowledgement sent back to the author of each line.
pub const ACK_LINE: &str = "Message received";

/// Sent to a connection turned away because the broker is at capacity.
pub const CAPACITY_NOTICE: &str = "Server is full, try again later";

/// Sent to a connection that arrives while the broker is shutting down.
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down";

/// Longest accepted client line in bytes, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 4096;

/// A parsed client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    /// Whitespace only; neither acknowledged nor relayed
    Blank,
    /// Text to acknowledge and relay
    Text(String),
}

/// Errors for lines that violate the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("Line too long: {len} bytes (max: {max})")]
    TooLong { len: usize, max: usize },

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,
}

/// Parses one raw line as read from the socket (terminator included or not).
///
/// # Errors
///
/// `LineError::TooLong` past [`MAX_LINE_LENGTH`], `LineError::InvalidUtf8`
/// for non-UTF-8 input.
pub fn parse_line(raw: &[u8]) -> Result<ClientLine, LineError> {
    let content = strip_terminator(raw);
    if content.len() > MAX_LINE_LENGTH {
        return Err(LineError::TooLong {
            len: content.len(),
            max: MAX_LINE_LENGTH,
        });
    }

    let text = std::str::from_utf8(content).map_err(|_| LineError::InvalidUtf8)?;
    let text = text.trim();
    if text.is_empty() {
        Ok(ClientLine::Blank)
    } else {
        Ok(ClientLine::Text(text.to_string()))
    }
}

/// Formats the line relayed to other sessions: `<sender address>: <text>`.
pub fn broadcast_line(sender: SocketAddr, text: &str) -> String {
    format!("{sender}: {text}")
}

fn strip_terminator(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}
