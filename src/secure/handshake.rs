//! One step of a non-blocking TLS handshake.

use crate::error::Error;
use crate::multiplexer::Readiness;
use crate::socket::is_transient;
use rustls::Connection;
use std::io::{Read, Write};
use tracing::{debug, trace};

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeProgress {
    WantRead,
    WantWrite,
    Complete,
}

/// Advances `conn` by at most one read or one write on `io`.
///
/// Pending output is flushed before more input is read, so the final flight
/// of the handshake is on the wire before it reports completion.
pub(crate) fn step<S: Read + Write>(
    conn: &mut Connection,
    io: &mut S,
    ready: Readiness,
) -> Result<HandshakeProgress, Error> {
    if conn.wants_write() {
        if ready.writable {
            match conn.write_tls(io) {
                Ok(n) => trace!(len = n, "Wrote handshake data"),
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    } else if ready.readable {
        match conn.read_tls(io) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => {
                trace!(len = n, "Read handshake data");
                if let Err(err) = conn.process_new_packets() {
                    // Let the peer know why, if the alert fits in the socket
                    let _ = conn.write_tls(io);
                    debug!(%err, "Handshake rejected");
                    return Err(err.into());
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(progress(conn))
}

fn progress(conn: &Connection) -> HandshakeProgress {
    if conn.wants_write() {
        HandshakeProgress::WantWrite
    } else if conn.is_handshaking() {
        HandshakeProgress::WantRead
    } else {
        HandshakeProgress::Complete
    }
}
