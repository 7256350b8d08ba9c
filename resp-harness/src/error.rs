//! Error taxonomy shared by the codec, connections, and process control.
//!
//! Assertion mismatches are deliberately absent: a reply that differs from
//! what a check expected is recorded in the report, not raised.

use std::io;

use thiserror::Error;

/// Result alias used throughout the library half of the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Malformed or unrecognized reply framing, or a read that stalled partway through
    /// a reply. Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer closed the socket before a full reply was read.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A wait exceeded its bound, or a socket read timed out before any byte of the
    /// next reply arrived.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The server process could not be started.
    #[error("failed to launch {program}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(io::Error),
}

impl HarnessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout(_))
    }

    /// Whether the error leaves the connection it came from unusable.
    pub fn is_fatal_to_connection(&self) -> bool {
        !self.is_timeout()
    }
}

impl From<io::Error> for HarnessError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => HarnessError::ConnectionClosed,
            // Socket read timeouts surface as WouldBlock on unix, TimedOut on windows.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                HarnessError::Timeout(format!("socket read: {err}"))
            }
            _ => HarnessError::Io(err),
        }
    }
}
