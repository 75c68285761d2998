use thiserror::Error;

/// The error type for kvmlink operations.
///
/// Errors fall into three groups. Transient conditions (a non-blocking call
/// that would block) never show up here; they are reported as zero bytes
/// transferred. Connection-fatal errors end the socket and are reported once
/// through [`TransportEvent::Failed`](crate::TransportEvent::Failed).
/// Programming errors (operating on a closed socket, connecting twice) are
/// returned directly to the caller.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The address string could not be parsed into host and port.
    #[error("Invalid network address '{0}'")]
    InvalidAddress(String),

    /// The host name did not resolve to any socket address.
    #[error("Could not resolve '{host}': {reason}")]
    Resolve { host: String, reason: String },

    /// The peer closed the stream.
    #[error("Connection closed by peer")]
    PeerClosed,

    // ============================================================================
    // Contract Violations
    // ============================================================================

    /// Operation on a socket that has been closed.
    #[error("Socket {id} is closed")]
    SocketClosed { id: usize },

    /// Operation not valid for the socket's current state.
    #[error("Socket {id} cannot {operation} while {state}")]
    InvalidState {
        id: usize,
        operation: &'static str,
        state: String,
    },

    /// The socket already failed; no further I/O is serviced.
    #[error("Socket {id} already failed")]
    AlreadyFailed { id: usize },

    /// The multiplexer's poll loop is no longer running.
    #[error("Multiplexer is not running")]
    MultiplexerStopped,

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Generating the local self-signed certificate failed.
    #[error("Failed to generate certificate: {0}")]
    TlsCertificateGenerate(String),

    /// Secure transport requested but no certificate is configured.
    #[error("TLS certificate not configured - set tls_cert and tls_key")]
    TlsNotConfigured,

    /// Failed to build the rustls client or server configuration.
    #[error("Failed to build TLS config: {0}")]
    TlsConfigBuild(String),

    /// The TLS library rejected the handshake or a record.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    // ============================================================================
    // Trust Errors
    // ============================================================================

    /// Peer presented a certificate that differs from the recorded one.
    #[error("Fingerprint mismatch for {peer}: expected {expected}, got {actual}")]
    FingerprintMismatch {
        peer: String,
        expected: String,
        actual: String,
    },

    /// Peer is unknown and the trust policy requires confirmation first.
    #[error("Untrusted fingerprint for {peer}: {fingerprint}")]
    UntrustedFingerprint { peer: String, fingerprint: String },

    /// Peer completed the handshake without presenting a certificate.
    #[error("Peer presented no certificate")]
    MissingPeerCertificate,

    /// A fingerprint string could not be parsed.
    #[error("Invalid fingerprint '{0}'")]
    InvalidFingerprint(String),

    /// Reading or writing the trust store file failed.
    #[error("Trust store {path}: {reason}")]
    TrustStore { path: String, reason: String },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for `trust_policy`.
    #[error("Invalid trust policy '{got}', expected one of: tofu, confirm")]
    InvalidTrustPolicy { got: String },
}

impl Error {
    /// Whether the error ends the connection it happened on.
    ///
    /// Contract violations are reported to the caller but leave the socket
    /// as it was.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::SocketClosed { .. }
                | Error::InvalidState { .. }
                | Error::AlreadyFailed { .. }
                | Error::InvalidAddress(_)
                | Error::MultiplexerStopped
        )
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::TlsHandshake(err.to_string())
    }
}
