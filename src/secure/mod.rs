//! TLS layer: certificates, fingerprints, peer trust and the secure socket.

mod certificate;
mod context;
mod fingerprint;
mod handshake;
mod socket;
mod trust;

pub use certificate::LocalIdentity;
pub use context::TlsContext;
pub use fingerprint::Fingerprint;
pub use socket::SecureSocket;
pub use trust::{FileTrustStore, MemoryTrustStore, TrustPolicy, TrustStore, TrustVerifier};
