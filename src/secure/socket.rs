//! TLS over a [`TcpSocket`].
//!
//! The encryption context lives behind one mutex and every access takes it,
//! teardown included. The poll thread holds it for the duration of a job
//! step, so [`SecureSocket::close`] from another thread waits for an
//! in-flight step to finish and the step that follows sees the socket
//! closed.
//!
//! Lock order is TLS state, then the plain socket's state, then the
//! multiplexer's job table. Jobs are only ever registered with no socket lock
//! held.

use super::context::TlsContext;
use super::fingerprint::Fingerprint;
use super::handshake::{self, HandshakeProgress};
use crate::address::NetworkAddress;
use crate::config::TransportConfig;
use crate::error::Error;
use crate::events::{EventQueue, SocketId, TransportEvent};
use crate::multiplexer::{Job, JobResult, JobTarget, MultiplexerHandle, Readiness, Step};
use crate::socket::{is_transient, ConnectProgress, DataSocket, SocketState, TcpSocket};
use mio::net::TcpStream;
use mio::{Interest, Registry};
use rustls::Connection;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Handshaking(Role),
    SecureReady,
    /// The peer ended the session. Received plaintext can still be read.
    Finished,
    Fatal,
    Closed,
}

struct TlsState {
    conn: Option<Connection>,
    phase: Phase,
    server_name: Option<String>,
    peer_fingerprint: Option<Fingerprint>,
    output_blocked: bool,
    reading_paused: bool,
}

/// Result of one transfer step, evaluated after the stream is released.
enum Transferred {
    Nothing,
    Plaintext(usize),
    Flushed,
    /// The peer closed; carries the plaintext still buffered.
    Ended(usize),
}

/// A [`TcpSocket`] carrying a mutually authenticated TLS session.
///
/// Clients start the handshake once TCP is connected; accepted sockets start
/// it right away. The peer's certificate is judged by the context's
/// [`TrustVerifier`](super::TrustVerifier) when the handshake completes. Until
/// then [`read`](DataSocket::read) and [`write`](DataSocket::write) transfer
/// nothing.
pub struct SecureSocket {
    plain: TcpSocket,
    me: Weak<SecureSocket>,
    context: Arc<TlsContext>,
    tls: Mutex<TlsState>,
    peer_id: Mutex<Option<String>>,
}

impl fmt::Debug for SecureSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tls = self.lock_tls();
        f.debug_struct("SecureSocket")
            .field("id", &self.plain.id())
            .field("phase", &tls.phase)
            .field("peer_fingerprint", &tls.peer_fingerprint)
            .finish()
    }
}

impl SecureSocket {
    /// Creates an unconnected secure socket.
    pub fn new(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: Arc<TransportConfig>,
        context: Arc<TlsContext>,
    ) -> Arc<Self> {
        Self::build(mux, events, config, context, None)
    }

    /// Wraps an accepted stream and starts the server side of the handshake.
    ///
    /// The peer is identified by its IP address for the trust check.
    pub fn from_stream(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: Arc<TransportConfig>,
        context: Arc<TlsContext>,
        stream: TcpStream,
    ) -> Result<Arc<Self>, Error> {
        let socket = Self::build(mux, events, config, context, Some(stream));
        if let Some(peer) = socket.plain.peer_addr() {
            socket.set_peer_id(peer.ip().to_string());
        }
        socket.plain.announce_accepted();
        socket.secure_accept()?;
        Ok(socket)
    }

    fn build(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: Arc<TransportConfig>,
        context: Arc<TlsContext>,
        stream: Option<TcpStream>,
    ) -> Arc<Self> {
        let id = mux.next_socket_id();
        Arc::new_cyclic(|me: &Weak<SecureSocket>| {
            let owner: Weak<dyn JobTarget> = me.clone();
            Self {
                plain: TcpSocket::with_owner(id, owner, mux, events, config, stream),
                me: me.clone(),
                context,
                tls: Mutex::new(TlsState {
                    conn: None,
                    phase: Phase::Idle,
                    server_name: None,
                    peer_fingerprint: None,
                    output_blocked: false,
                    reading_paused: false,
                }),
                peer_id: Mutex::new(None),
            }
        })
    }

    fn lock_tls(&self) -> MutexGuard<'_, TlsState> {
        self.tls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SocketId {
        self.plain.id()
    }

    /// The plain socket underneath.
    pub fn plain(&self) -> &TcpSocket {
        &self.plain
    }

    pub fn context(&self) -> &Arc<TlsContext> {
        &self.context
    }

    /// Whether the handshake completed and the peer is trusted.
    pub fn is_secure_ready(&self) -> bool {
        self.lock_tls().phase == Phase::SecureReady
    }

    /// Whether the TLS session failed. No further I/O happens on the socket.
    pub fn is_fatal(&self) -> bool {
        self.lock_tls().phase == Phase::Fatal
    }

    /// Fingerprint of the certificate the peer presented.
    ///
    /// Set as soon as the handshake delivers the certificate, so it stays
    /// available after the trust check rejected it.
    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.lock_tls().peer_fingerprint
    }

    /// The key the peer's fingerprint is recorded under.
    pub fn peer_id(&self) -> Option<String> {
        lock(&self.peer_id).clone()
    }

    pub fn set_peer_id(&self, peer_id: impl Into<String>) {
        *lock(&self.peer_id) = Some(peer_id.into());
    }

    /// Records the peer's presented fingerprint as trusted. Used to confirm
    /// an unknown peer before reconnecting.
    pub fn trust_peer(&self) -> Result<(), Error> {
        let fingerprint = self.peer_fingerprint().ok_or(Error::MissingPeerCertificate)?;
        let peer = self.trust_key();
        self.context.verifier().trust(&peer, fingerprint)
    }

    fn trust_key(&self) -> String {
        self.peer_id()
            .or_else(|| self.plain.peer_addr().map(|addr| addr.ip().to_string()))
            .unwrap_or_default()
    }

    fn register(&self, job: Job) -> Result<(), Error> {
        let me = self.me.upgrade().ok_or(Error::SocketClosed { id: self.id() })?;
        self.plain.multiplexer().add_job(me, job)
    }

    // ============================================================================
    // Handshake
    // ============================================================================

    /// Starts the client handshake on a connected socket.
    pub fn secure_connect(&self) -> Result<(), Error> {
        let job = self.begin_handshake(Role::Client)?;
        self.register(job)
    }

    /// Starts the server handshake on a connected socket.
    pub fn secure_accept(&self) -> Result<(), Error> {
        let job = self.begin_handshake(Role::Server)?;
        self.register(job)
    }

    fn begin_handshake(&self, role: Role) -> Result<Job, Error> {
        let mut tls = self.lock_tls();
        match tls.phase {
            Phase::Idle => {}
            Phase::Closed => return Err(Error::SocketClosed { id: self.id() }),
            Phase::Fatal => return Err(Error::AlreadyFailed { id: self.id() }),
            phase => {
                return Err(Error::InvalidState {
                    id: self.id(),
                    operation: "start a handshake",
                    state: format!("{phase:?}"),
                })
            }
        }
        let state = self.plain.state();
        if state != SocketState::Connected {
            return Err(Error::InvalidState {
                id: self.id(),
                operation: "start a handshake",
                state: state.to_string(),
            });
        }

        let mut conn = match role {
            Role::Client => {
                let host = tls.server_name.as_deref().unwrap_or_default();
                Connection::Client(self.context.client_connection(host)?)
            }
            Role::Server => Connection::Server(self.context.server_connection()?),
        };
        conn.set_buffer_limit(Some(self.plain.config().send_buffer_limit));

        tls.conn = Some(conn);
        tls.phase = Phase::Handshaking(role);
        self.plain.set_state(SocketState::Handshaking);
        debug!(id = self.id(), ?role, "Handshake started");

        Ok(match role {
            Role::Client => Job::handshake_write(),
            Role::Server => Job::handshake_read(),
        })
    }

    fn handshake_step(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        let mut tls = self.lock_tls();
        let Phase::Handshaking(role) = tls.phase else {
            return Ok(JobResult::Done);
        };
        let Some(conn) = tls.conn.as_mut() else {
            return Ok(JobResult::Done);
        };
        let Some(progress) = self
            .plain
            .with_stream(|stream| handshake::step(conn, stream, ready))
        else {
            return Ok(JobResult::Done);
        };

        match progress? {
            HandshakeProgress::WantRead => Ok(job.yield_to(Job::handshake_read())),
            HandshakeProgress::WantWrite => Ok(job.yield_to(Job::handshake_write())),
            HandshakeProgress::Complete => match self.complete_handshake(&mut tls, role)? {
                Some(next) => Ok(JobResult::Transition(next)),
                None => {
                    // Resumed by secure_read once buffered plaintext is drained
                    tls.reading_paused = true;
                    Ok(JobResult::Done)
                }
            },
        }
    }

    /// Verifies the peer and switches to data transfer. Returns `None` when
    /// there is nothing to wait for until the application reads.
    fn complete_handshake(&self, tls: &mut TlsState, role: Role) -> Result<Option<Job>, Error> {
        let conn = tls.conn.as_mut().ok_or(Error::SocketClosed { id: self.id() })?;
        let fingerprint = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(Fingerprint::of_certificate)
            .ok_or(Error::MissingPeerCertificate)?;
        tls.peer_fingerprint = Some(fingerprint);

        let peer = self.trust_key();
        self.context.verifier().verify(&peer, &fingerprint)?;

        tls.phase = Phase::SecureReady;
        self.plain.set_state(SocketState::SecureConnected);
        self.plain.post(TransportEvent::SecureConnected {
            id: self.id(),
            fingerprint,
        });
        info!(id = self.id(), ?role, %peer, %fingerprint, "Secure connection established");

        // Application data may have arrived with the final handshake flight
        let conn = tls.conn.as_mut().ok_or(Error::SocketClosed { id: self.id() })?;
        let io_state = conn.process_new_packets()?;
        if io_state.plaintext_bytes_to_read() > 0 {
            self.plain.post(TransportEvent::InputReady { id: self.id() });
        }

        Ok(transfer_interest(tls).map(Job::transfer))
    }

    // ============================================================================
    // Data transfer
    // ============================================================================

    fn transfer_step(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        let mut guard = self.lock_tls();
        let tls = &mut *guard;
        if tls.phase != Phase::SecureReady {
            return Ok(JobResult::Done);
        }
        let Some(conn) = tls.conn.as_mut() else {
            return Ok(JobResult::Done);
        };

        let Some(transferred) = self
            .plain
            .with_stream(|stream| transfer_once(conn, stream, ready))
        else {
            return Ok(JobResult::Done);
        };

        match transferred? {
            Transferred::Nothing => {}
            Transferred::Plaintext(len) => {
                trace!(id = self.id(), len, "Decrypted input");
                self.plain.post(TransportEvent::InputReady { id: self.id() });
            }
            Transferred::Flushed => {
                if tls.output_blocked {
                    tls.output_blocked = false;
                    self.plain.post(TransportEvent::OutputReady { id: self.id() });
                }
            }
            Transferred::Ended(pending) => {
                if pending > 0 {
                    self.plain.post(TransportEvent::InputReady { id: self.id() });
                }
                tls.phase = Phase::Finished;
                self.plain.peer_closed();
                return Ok(JobResult::Done);
            }
        }

        let interest = transfer_interest(tls);
        Ok(match interest {
            Some(interest) => job.yield_to(Job::transfer(interest)),
            None => {
                tls.reading_paused = true;
                JobResult::Done
            }
        })
    }

    /// Reads decrypted bytes. Returns 0 when none are available or before the
    /// session is established.
    ///
    /// # Errors
    ///
    /// [`Error::SocketClosed`] once the socket is closed and no plaintext is
    /// left.
    pub fn secure_read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (n, resume) = {
            let mut guard = self.lock_tls();
            let tls = &mut *guard;
            match tls.phase {
                Phase::SecureReady | Phase::Finished => {}
                Phase::Closed => return Err(Error::SocketClosed { id: self.id() }),
                Phase::Idle | Phase::Handshaking(_) | Phase::Fatal => return Ok(0),
            }
            let Some(conn) = tls.conn.as_mut() else {
                return Err(Error::SocketClosed { id: self.id() });
            };

            let n = match conn.reader().read(buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
                // Peer went away without close_notify
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => 0,
                Err(err) => return Err(err.into()),
            };
            if n == 0 && tls.phase == Phase::Finished && !buf.is_empty() {
                return Err(Error::SocketClosed { id: self.id() });
            }

            let resume = tls.reading_paused && tls.phase == Phase::SecureReady && conn.wants_read();
            if resume {
                tls.reading_paused = false;
            }
            (n, resume.then(|| transfer_interest(tls)).flatten())
        };

        if let Some(interest) = resume {
            if let Err(err) = self.register(Job::transfer(interest)) {
                warn!(id = self.id(), %err, "Failed to resume reading");
            }
        }
        Ok(n)
    }

    /// Encrypts bytes from `buf` for sending. Accepts fewer bytes than offered
    /// when the outgoing TLS buffer is full; an `OutputReady` event follows
    /// once it drained. Returns 0 before the session is established.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyFailed`] after a fatal TLS or trust failure.
    /// - [`Error::SocketClosed`] after close or after the peer ended the
    ///   session.
    pub fn secure_write(&self, buf: &[u8]) -> Result<usize, Error> {
        let (n, interest) = {
            let mut guard = self.lock_tls();
            let tls = &mut *guard;
            match tls.phase {
                Phase::SecureReady => {}
                Phase::Fatal => return Err(Error::AlreadyFailed { id: self.id() }),
                Phase::Closed | Phase::Finished => {
                    return Err(Error::SocketClosed { id: self.id() })
                }
                Phase::Idle | Phase::Handshaking(_) => return Ok(0),
            }
            let Some(conn) = tls.conn.as_mut() else {
                return Err(Error::SocketClosed { id: self.id() });
            };

            let n = match conn.writer().write(buf) {
                Ok(n) => n,
                Err(err) if is_transient(&err) => 0,
                Err(err) => return Err(err.into()),
            };
            if n < buf.len() {
                tls.output_blocked = true;
            }
            tls.reading_paused = false;
            (n, transfer_interest(tls))
        };

        trace!(id = self.id(), len = n, offered = buf.len(), "Queued plaintext");
        if let Some(interest) = interest {
            self.register(Job::transfer(interest))?;
        }
        Ok(n)
    }

    /// Closes the session and the socket. Idempotent and safe to call while
    /// the poll thread is working on the socket.
    ///
    /// Sends `close_notify` with one best-effort write if a session was up.
    #[instrument(skip(self), fields(id = self.id()))]
    pub fn close(&self) {
        self.plain.multiplexer().remove_job(self.id());

        let mut tls = self.lock_tls();
        if let Some(mut conn) = tls.conn.take() {
            if matches!(tls.phase, Phase::SecureReady | Phase::Handshaking(_)) {
                conn.send_close_notify();
                match self.plain.with_stream(|stream| conn.write_tls(stream)) {
                    Some(Err(err)) => warn!(?err, "Failed to send close_notify"),
                    Some(Ok(len)) => trace!(len, "Sent close_notify"),
                    None => {}
                }
            }
        }
        if tls.phase != Phase::Fatal {
            tls.phase = Phase::Closed;
        }
        self.plain.close();
    }

    fn fail(&self, err: Error) {
        let mut tls = self.lock_tls();
        if matches!(tls.phase, Phase::Fatal | Phase::Closed) {
            return;
        }
        tls.phase = Phase::Fatal;
        tls.conn = None;
        self.plain.fail(&err);
    }
}

fn transfer_once(
    conn: &mut Connection,
    stream: &mut TcpStream,
    ready: Readiness,
) -> Result<Transferred, Error> {
    if ready.readable && conn.wants_read() {
        match conn.read_tls(stream) {
            Ok(0) => return Ok(Transferred::Ended(0)),
            Ok(_) => {
                let io_state = match conn.process_new_packets() {
                    Ok(io_state) => io_state,
                    Err(err) => {
                        let _ = conn.write_tls(stream);
                        return Err(err.into());
                    }
                };
                if io_state.peer_has_closed() {
                    return Ok(Transferred::Ended(io_state.plaintext_bytes_to_read()));
                }
                if io_state.plaintext_bytes_to_read() > 0 {
                    return Ok(Transferred::Plaintext(io_state.plaintext_bytes_to_read()));
                }
            }
            Err(err) if is_transient(&err) => {}
            Err(err) => return Err(err.into()),
        }
    } else if ready.writable && conn.wants_write() {
        match conn.write_tls(stream) {
            Ok(_) if !conn.wants_write() => return Ok(Transferred::Flushed),
            Ok(_) => {}
            Err(err) if is_transient(&err) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Transferred::Nothing)
}

fn transfer_interest(tls: &TlsState) -> Option<Interest> {
    let conn = tls.conn.as_ref()?;
    match (conn.wants_read(), conn.wants_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobTarget for SecureSocket {
    fn id(&self) -> SocketId {
        self.plain.id()
    }

    fn run_job(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        match job.step() {
            Step::Connect => match self.plain.finish_connect()? {
                ConnectProgress::Pending => Ok(JobResult::Continue),
                ConnectProgress::Connected => {
                    let next = self.begin_handshake(Role::Client)?;
                    Ok(JobResult::Transition(next))
                }
                ConnectProgress::Aborted => Ok(JobResult::Done),
            },
            Step::Handshake => self.handshake_step(job, ready),
            Step::Transfer => self.transfer_step(job, ready),
            Step::Accept => {
                warn!(id = self.id(), "Unexpected accept job for secure socket");
                Ok(JobResult::Done)
            }
        }
    }

    fn job_failed(&self, err: Error) {
        self.fail(err);
    }

    fn arm(&self, registry: &Registry, interest: Interest) -> io::Result<bool> {
        self.plain.arm_stream(registry, interest)
    }
}

impl DataSocket for SecureSocket {
    fn id(&self) -> SocketId {
        self.plain.id()
    }

    /// Connects and then runs the client handshake. The connect address is
    /// the peer's identity for the trust check unless one was set.
    #[instrument(skip(self), fields(id = self.plain.id()))]
    fn connect(&self, address: &NetworkAddress) -> Result<(), Error> {
        {
            let mut peer_id = lock(&self.peer_id);
            if peer_id.is_none() {
                *peer_id = Some(address.to_string());
            }
        }
        self.lock_tls().server_name = Some(address.host().to_string());
        DataSocket::connect(&self.plain, address)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.secure_read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.secure_write(buf)
    }

    fn close(&self) {
        SecureSocket::close(self)
    }

    fn state(&self) -> SocketState {
        self.plain.state()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.plain.peer_addr()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.plain.local_addr()
    }

    fn as_secure(&self) -> Option<&SecureSocket> {
        Some(self)
    }
}

impl Drop for SecureSocket {
    fn drop(&mut self) {
        self.close();
    }
}
