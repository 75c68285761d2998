//! kvmlink - Readiness-driven socket transport for keyboard and mouse sharing
//!
//! kvmlink moves bytes between the machines of a KVM-sharing setup. A single
//! poll thread (the [`Multiplexer`]) watches every socket and runs a short,
//! non-blocking job whenever one becomes ready. Sockets report what happened
//! through [`TransportEvent`]s, which the application drains on its own thread.
//!
//! Two socket flavors share the [`DataSocket`] interface:
//!
//! - [`TcpSocket`]: plain TCP with bounded send and receive buffers.
//! - [`SecureSocket`]: TLS on top of a [`TcpSocket`]. Peers are identified by
//!   the SHA-256 [`Fingerprint`] of their certificate and judged by a
//!   [`TrustPolicy`] (trust-on-first-use by default).
//!
//! [`Transport`] bundles a multiplexer, an event channel and a
//! [`SocketFactory`] for the common case.

// Internal-only modules
pub(crate) mod address;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod events;
pub(crate) mod factory;
pub(crate) mod multiplexer;
pub(crate) mod secure;
pub(crate) mod socket;
pub(crate) mod transport;

// These are the intended public API
pub use address::{NetworkAddress, DEFAULT_PORT};
pub use config::TransportConfig;
pub use error::Error;
pub use events::{event_channel, EventQueue, EventReceiver, SocketId, TransportEvent};
pub use factory::SocketFactory;
pub use multiplexer::{Job, JobResult, JobTarget, Multiplexer, MultiplexerHandle, Readiness, Step};
pub use secure::{
    FileTrustStore, Fingerprint, LocalIdentity, MemoryTrustStore, SecureSocket, TlsContext,
    TrustPolicy, TrustStore, TrustVerifier,
};
pub use socket::{DataSocket, SocketState, TcpListenSocket, TcpSocket};
pub use transport::Transport;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::address::NetworkAddress;
    pub use crate::config::TransportConfig;
    pub use crate::error::Error;
    pub use crate::events::{SocketId, TransportEvent};
    pub use crate::factory::SocketFactory;
    pub use crate::secure::{Fingerprint, SecureSocket, TrustPolicy};
    pub use crate::socket::{DataSocket, SocketState};
    pub use crate::transport::Transport;
}
