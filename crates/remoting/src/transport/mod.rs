//! # Transport Abstraction
//!
//! A minimal, async interface for moving framed bytes between two peers.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about calls, values or
//!   object ids. It moves opaque frames.
//! - **Message Boundaries**: One `send` is observed as exactly one `recv` on
//!   the other side. Stream transports add their own length prefix.
//! - **Single Reader**: Exactly one task calls `recv`; any number may `send`.

use std::fmt;

pub mod memory;
pub mod tcp;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The frame exceeds the configured maximum length.
    PayloadTooLarge(usize),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge(len) => write!(f, "Payload of {} bytes too large for transport", len),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional, message-oriented byte channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    ///
    /// # Invariants
    /// - Concurrent senders never interleave the bytes of two frames.
    /// - Must not interpret the payload.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` once the peer has closed the channel cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending half so the peer observes end of stream.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
