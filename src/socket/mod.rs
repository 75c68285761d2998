//! Non-blocking byte-stream sockets driven by the multiplexer.

mod lifecycle;
mod listener;
mod tcp;

pub(crate) use lifecycle::Lifecycle;
pub use listener::TcpListenSocket;
pub use tcp::TcpSocket;
pub(crate) use tcp::{is_transient, ConnectProgress};

use crate::address::NetworkAddress;
use crate::error::Error;
use crate::events::SocketId;
use crate::secure::SecureSocket;
use std::fmt;
use std::net::SocketAddr;

/// Connection state of a socket. Exactly one applies at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    /// Byte stream established, no encryption.
    Connected,
    Handshaking,
    /// TLS established and the peer passed the trust check.
    SecureConnected,
    Closing,
    Closed,
    /// Terminal failure; no further I/O is attempted.
    Failed,
}

impl SocketState {
    /// Whether the byte stream is up (encrypted or not).
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SocketState::Connected | SocketState::Handshaking | SocketState::SecureConnected
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SocketState::Closed | SocketState::Failed)
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Unconnected => "unconnected",
            SocketState::Connecting => "connecting",
            SocketState::Connected => "connected",
            SocketState::Handshaking => "handshaking",
            SocketState::SecureConnected => "connected (secure)",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
            SocketState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The capability set shared by plain and secure sockets.
///
/// All operations are non-blocking. `read` and `write` return the number of
/// bytes transferred, which is zero when nothing can be moved right now;
/// callers retry after the next [`TransportEvent::InputReady`] or
/// [`TransportEvent::OutputReady`].
///
/// [`TransportEvent::InputReady`]: crate::TransportEvent::InputReady
/// [`TransportEvent::OutputReady`]: crate::TransportEvent::OutputReady
pub trait DataSocket: Send + Sync + fmt::Debug {
    fn id(&self) -> SocketId;

    /// Starts connecting to `address`. Completion and failure are reported as
    /// events.
    fn connect(&self, address: &NetworkAddress) -> Result<(), Error>;

    fn read(&self, buf: &mut [u8]) -> Result<usize, Error>;

    fn write(&self, buf: &[u8]) -> Result<usize, Error>;

    /// Closes the socket. Idempotent and callable from any thread.
    fn close(&self);

    fn state(&self) -> SocketState;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// The secure socket behind this handle, if it is one.
    fn as_secure(&self) -> Option<&SecureSocket> {
        None
    }

    fn is_secure(&self) -> bool {
        self.as_secure().is_some()
    }
}
