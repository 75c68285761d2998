//! Plain non-blocking TCP socket.
//!
//! The socket owns two buffers. The poll thread moves bytes between them and
//! the OS socket, one system call per job invocation, while the application
//! reads and writes the buffers from its own thread.

use super::{DataSocket, Lifecycle, SocketState};
use crate::address::NetworkAddress;
use crate::config::TransportConfig;
use crate::error::Error;
use crate::events::{EventQueue, SocketId, TransportEvent};
use crate::multiplexer::{Job, JobResult, JobTarget, MultiplexerHandle, Readiness, Step};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, instrument, trace, warn};

/// Outcome of checking a pending non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectProgress {
    Pending,
    Connected,
    /// The socket was closed or failed while connecting.
    Aborted,
}

struct StreamState {
    stream: Option<TcpStream>,
    state: SocketState,
    registered: bool,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    input: Vec<u8>,
    output: Vec<u8>,
    output_blocked: bool,
    reading_paused: bool,
    lifecycle: Lifecycle,
}

impl StreamState {
    fn new(stream: Option<TcpStream>) -> Self {
        let (state, peer_addr, local_addr) = match &stream {
            Some(stream) => (
                SocketState::Connected,
                stream.peer_addr().ok(),
                stream.local_addr().ok(),
            ),
            None => (SocketState::Unconnected, None, None),
        };
        Self {
            stream,
            state,
            registered: false,
            peer_addr,
            local_addr,
            input: Vec::new(),
            output: Vec::new(),
            output_blocked: false,
            reading_paused: false,
            lifecycle: Lifecycle::default(),
        }
    }

    fn data_interest(&self) -> Option<Interest> {
        let read = !self.reading_paused;
        let write = !self.output.is_empty();
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// A non-blocking TCP byte stream.
///
/// Created unconnected by the [`SocketFactory`](crate::SocketFactory), or
/// connected from an accepted stream. Jobs for the socket are run on behalf
/// of its owner, which is the socket itself or the
/// [`SecureSocket`](crate::SecureSocket) wrapping it.
pub struct TcpSocket {
    id: SocketId,
    owner: Weak<dyn JobTarget>,
    mux: MultiplexerHandle,
    events: EventQueue,
    config: Arc<TransportConfig>,
    inner: Mutex<StreamState>,
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("peer_addr", &inner.peer_addr)
            .finish()
    }
}

impl TcpSocket {
    /// Creates an unconnected socket.
    pub fn new(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: Arc<TransportConfig>,
    ) -> Arc<Self> {
        let id = mux.next_socket_id();
        Arc::new_cyclic(|me: &Weak<TcpSocket>| {
            let owner: Weak<dyn JobTarget> = me.clone();
            Self::with_owner(id, owner, mux, events, config, None)
        })
    }

    /// Wraps an accepted stream. The socket starts connected, posts
    /// `Connected` and starts reading.
    pub fn from_stream(
        mux: MultiplexerHandle,
        events: EventQueue,
        config: Arc<TransportConfig>,
        stream: TcpStream,
    ) -> Result<Arc<Self>, Error> {
        let id = mux.next_socket_id();
        let socket = Arc::new_cyclic(|me: &Weak<TcpSocket>| {
            let owner: Weak<dyn JobTarget> = me.clone();
            Self::with_owner(id, owner, mux, events, config, Some(stream))
        });
        socket.announce_accepted();
        socket.register(Job::transfer(Interest::READABLE))?;
        Ok(socket)
    }

    /// Builds a socket whose jobs are run by `owner`.
    pub(crate) fn with_owner(
        id: SocketId,
        owner: Weak<dyn JobTarget>,
        mux: MultiplexerHandle,
        events: EventQueue,
        config: Arc<TransportConfig>,
        stream: Option<TcpStream>,
    ) -> Self {
        if let Some(stream) = &stream {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(id, ?err, "Failed to set TCP_NODELAY");
            }
        }
        Self {
            id,
            owner,
            mux,
            events,
            config,
            inner: Mutex::new(StreamState::new(stream)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> SocketState {
        self.lock().state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn multiplexer(&self) -> &MultiplexerHandle {
        &self.mux
    }

    /// The job the socket needs for its current state, if any.
    pub fn new_job(&self) -> Option<Job> {
        let inner = self.lock();
        match inner.state {
            SocketState::Connecting => Some(Job::connect()),
            SocketState::Connected => inner.data_interest().map(Job::transfer),
            _ => None,
        }
    }

    /// Registers `job` with the multiplexer on behalf of the owner.
    ///
    /// Must not be called with the state lock held.
    pub(crate) fn register(&self, job: Job) -> Result<(), Error> {
        let owner = self
            .owner
            .upgrade()
            .ok_or(Error::SocketClosed { id: self.id })?;
        self.mux.add_job(owner, job)
    }

    fn reregister_data_job(&self) {
        let Some(job) = self.new_job() else {
            return;
        };
        if let Err(err) = self.register(job) {
            warn!(id = self.id, %err, "Failed to re-register data job");
        }
    }

    // ============================================================================
    // Connection Management
    // ============================================================================

    /// Starts a non-blocking connect and posts `Connecting`.
    ///
    /// Returns whether a connect is now in flight. Resolution failures and
    /// immediate OS failures are reported through a `Failed` event, not as an
    /// error.
    pub(crate) fn start_connect(&self, address: &NetworkAddress) -> Result<bool, Error> {
        if self.state() != SocketState::Unconnected {
            return Err(self.invalid_state("connect"));
        }
        let resolved = address.resolve();

        let mut inner = self.lock();
        let inner = &mut *inner;
        if inner.state != SocketState::Unconnected {
            return Err(Error::InvalidState {
                id: self.id,
                operation: "connect",
                state: inner.state.to_string(),
            });
        }

        inner.state = SocketState::Connecting;
        inner.lifecycle.post(&self.events, TransportEvent::Connecting { id: self.id });
        let target = match resolved {
            Ok(target) => target,
            Err(err) => {
                error!(id = self.id, %address, %err, "Resolve failed");
                inner.state = SocketState::Failed;
                inner.lifecycle.failed(&self.events, self.id, err.to_string());
                return Ok(false);
            }
        };
        inner.peer_addr = Some(target);

        match TcpStream::connect(target) {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(id = self.id, ?err, "Failed to set TCP_NODELAY");
                }
                inner.stream = Some(stream);
                info!(id = self.id, %address, %target, "Connecting");
                Ok(true)
            }
            Err(err) => {
                error!(id = self.id, %address, ?err, "Connect failed");
                inner.state = SocketState::Failed;
                inner
                    .lifecycle
                    .failed(&self.events, self.id, Error::from(err).to_string());
                Ok(false)
            }
        }
    }

    /// Checks whether a pending connect has completed, and if so marks the
    /// socket connected and posts `Connected`.
    pub(crate) fn finish_connect(&self) -> Result<ConnectProgress, Error> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        if inner.state != SocketState::Connecting {
            return Ok(ConnectProgress::Aborted);
        }
        let Some(stream) = inner.stream.as_ref() else {
            return Ok(ConnectProgress::Aborted);
        };

        if let Some(err) = stream.take_error()? {
            return Err(err.into());
        }
        match stream.peer_addr() {
            Ok(peer) => {
                inner.peer_addr = Some(peer);
                inner.local_addr = stream.local_addr().ok();
                inner.state = SocketState::Connected;
                inner.lifecycle.post(&self.events, TransportEvent::Connected { id: self.id });
                info!(id = self.id, %peer, "Connected");
                Ok(ConnectProgress::Connected)
            }
            Err(err) if err.kind() == ErrorKind::NotConnected || err.kind() == ErrorKind::WouldBlock => {
                Ok(ConnectProgress::Pending)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Posts `Connected` for a socket created from an accepted stream.
    pub(crate) fn announce_accepted(&self) {
        let mut inner = self.lock();
        let inner = &mut *inner;
        if inner.state == SocketState::Connected {
            inner.lifecycle.post(&self.events, TransportEvent::Connected { id: self.id });
            info!(id = self.id, peer = ?inner.peer_addr, "Accepted connection");
        }
    }

    /// Closes the socket. Idempotent.
    ///
    /// Removes the job first, so no step starts afterwards, then drops the OS
    /// handle. Posts `Disconnected` unless the socket never started
    /// connecting or already ended.
    #[instrument(skip(self), fields(id = self.id))]
    pub fn close(&self) {
        self.mux.remove_job(self.id);

        let mut inner = self.lock();
        if inner.state == SocketState::Closed {
            return;
        }
        let announce = inner.state != SocketState::Unconnected;
        inner.state = SocketState::Closing;
        self.release_stream(&mut inner);
        inner.state = SocketState::Closed;
        if announce {
            inner.lifecycle.post(&self.events, TransportEvent::Disconnected { id: self.id });
        }
        info!("Socket closed");
    }

    /// Marks the socket failed and posts `Failed` once.
    pub(crate) fn fail(&self, err: &Error) {
        self.mux.remove_job(self.id);

        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        self.release_stream(&mut inner);
        inner.state = SocketState::Failed;
        error!(id = self.id, %err, "Socket failed");
        inner.lifecycle.failed(&self.events, self.id, err.to_string());
    }

    /// The peer closed the stream. Buffered input stays readable.
    pub(crate) fn peer_closed(&self) {
        let mut inner = self.lock();
        self.peer_closed_locked(&mut inner);
    }

    fn peer_closed_locked(&self, inner: &mut StreamState) {
        if inner.state.is_terminal() {
            return;
        }
        self.release_stream(inner);
        inner.state = SocketState::Closed;
        inner.lifecycle.post(&self.events, TransportEvent::Disconnected { id: self.id });
        info!(id = self.id, "Peer closed connection");
    }

    fn release_stream(&self, inner: &mut StreamState) {
        if let Some(mut stream) = inner.stream.take() {
            if inner.registered {
                if let Err(err) = self.mux.registry().deregister(&mut stream) {
                    debug!(id = self.id, ?err, "Deregister failed");
                }
            }
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                trace!(id = self.id, ?err, "Shutdown failed");
            }
        }
        inner.registered = false;
    }

    // ============================================================================
    // Hooks for the secure layer
    // ============================================================================

    pub(crate) fn set_state(&self, state: SocketState) {
        let mut inner = self.lock();
        if !inner.state.is_terminal() {
            inner.state = state;
        }
    }

    /// Posts `event` through the socket's lifecycle guard.
    pub(crate) fn post(&self, event: TransportEvent) -> bool {
        self.lock().lifecycle.post(&self.events, event)
    }

    /// Runs `f` on the OS stream. Returns `None` once the stream is gone.
    pub(crate) fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> Option<R> {
        self.lock().stream.as_mut().map(f)
    }

    /// Registers or re-registers the stream with `interest`.
    pub(crate) fn arm_stream(&self, registry: &Registry, interest: Interest) -> io::Result<bool> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(stream) = inner.stream.as_mut() else {
            return Ok(false);
        };
        if inner.registered {
            registry.reregister(stream, Token(self.id), interest)?;
        } else {
            registry.register(stream, Token(self.id), interest)?;
            inner.registered = true;
        }
        Ok(true)
    }

    // ============================================================================
    // Data Operations
    // ============================================================================

    /// Copies buffered input into `buf`. Returns 0 when nothing is buffered.
    ///
    /// # Errors
    ///
    /// [`Error::SocketClosed`] once the socket is closed and its input drained.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (n, resume) = {
            let mut inner = self.lock();
            if inner.input.is_empty() {
                return match inner.state {
                    SocketState::Closed => Err(Error::SocketClosed { id: self.id }),
                    _ => Ok(0),
                };
            }

            let n = buf.len().min(inner.input.len());
            buf[..n].copy_from_slice(&inner.input[..n]);
            inner.input.drain(..n);

            let resume = inner.reading_paused
                && inner.input.len() < self.config.recv_buffer_limit
                && inner.state == SocketState::Connected;
            if resume {
                inner.reading_paused = false;
            }
            (n, resume)
        };

        trace!(id = self.id, len = n, "Read from input buffer");
        if resume {
            self.reregister_data_job();
        }
        Ok(n)
    }

    /// Queues bytes from `buf` for sending, up to the free space of the output
    /// buffer. May accept fewer bytes than offered, even none; an
    /// `OutputReady` event follows once space frees up.
    ///
    /// Bytes written while connecting are sent once the connection is up.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyFailed`] after a connection failure.
    /// - [`Error::SocketClosed`] after close.
    /// - [`Error::InvalidState`] before `connect`.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        let (n, job) = {
            let mut inner = self.lock();
            match inner.state {
                SocketState::Connecting | SocketState::Connected => {}
                SocketState::Failed => return Err(Error::AlreadyFailed { id: self.id }),
                SocketState::Closing | SocketState::Closed => {
                    return Err(Error::SocketClosed { id: self.id })
                }
                state => {
                    return Err(Error::InvalidState {
                        id: self.id,
                        operation: "write",
                        state: state.to_string(),
                    })
                }
            }

            let free = self
                .config
                .send_buffer_limit
                .saturating_sub(inner.output.len());
            let n = free.min(buf.len());
            inner.output.extend_from_slice(&buf[..n]);
            if n < buf.len() {
                inner.output_blocked = true;
            }

            let job = match inner.state {
                SocketState::Connected if n > 0 => inner.data_interest().map(Job::transfer),
                _ => None,
            };
            (n, job)
        };

        trace!(id = self.id, len = n, offered = buf.len(), "Queued output");
        if let Some(job) = job {
            self.register(job)?;
        }
        Ok(n)
    }

    // ============================================================================
    // Jobs
    // ============================================================================

    fn connect_step(&self) -> Result<JobResult, Error> {
        match self.finish_connect()? {
            ConnectProgress::Pending => Ok(JobResult::Continue),
            ConnectProgress::Connected => Ok(match self.new_job() {
                Some(job) => JobResult::Transition(job),
                None => JobResult::Done,
            }),
            ConnectProgress::Aborted => Ok(JobResult::Done),
        }
    }

    fn transfer_step(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.state != SocketState::Connected {
            return Ok(JobResult::Done);
        }
        let Some(stream) = inner.stream.as_mut() else {
            return Ok(JobResult::Done);
        };

        if ready.readable && !inner.reading_paused {
            let start = inner.input.len();
            inner.input.resize(start + self.config.max_read_size, 0);
            let result = stream.read(&mut inner.input[start..]);
            let read = match &result {
                Ok(n) => *n,
                Err(_) => 0,
            };
            inner.input.truncate(start + read);

            match result {
                Ok(0) => {
                    self.peer_closed_locked(inner);
                    return Ok(JobResult::Done);
                }
                Ok(n) => {
                    trace!(id = self.id, len = n, "Read from socket");
                    inner
                        .lifecycle
                        .post(&self.events, TransportEvent::InputReady { id: self.id });
                    if inner.input.len() >= self.config.recv_buffer_limit {
                        debug!(id = self.id, buffered = inner.input.len(), "Input buffer full, pausing reads");
                        inner.reading_paused = true;
                    }
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => return Err(err.into()),
            }
        } else if ready.writable && !inner.output.is_empty() {
            match stream.write(&inner.output) {
                Ok(n) => {
                    inner.output.drain(..n);
                    trace!(id = self.id, len = n, pending = inner.output.len(), "Wrote to socket");
                    if inner.output_blocked && inner.output.len() < self.config.send_buffer_limit {
                        inner.output_blocked = false;
                        inner
                            .lifecycle
                            .post(&self.events, TransportEvent::OutputReady { id: self.id });
                    }
                }
                Err(err) if is_transient(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(match inner.data_interest() {
            Some(interest) => job.yield_to(Job::transfer(interest)),
            None => JobResult::Done,
        })
    }

    fn invalid_state(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            id: self.id,
            operation,
            state: self.state().to_string(),
        }
    }

    /// Runs one step of a plain socket job. Shared with the secure layer for
    /// the connect phase.
    pub(crate) fn run_plain_job(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        match job.step() {
            Step::Connect => self.connect_step(),
            Step::Transfer => self.transfer_step(job, ready),
            step => {
                warn!(id = self.id, ?step, "Unexpected job for TCP socket");
                Ok(JobResult::Done)
            }
        }
    }
}

pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

impl JobTarget for TcpSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn run_job(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        self.run_plain_job(job, ready)
    }

    fn job_failed(&self, err: Error) {
        self.fail(&err);
    }

    fn arm(&self, registry: &Registry, interest: Interest) -> io::Result<bool> {
        self.arm_stream(registry, interest)
    }
}

impl DataSocket for TcpSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    #[instrument(skip(self), fields(id = self.id))]
    fn connect(&self, address: &NetworkAddress) -> Result<(), Error> {
        if self.start_connect(address)? {
            self.register(Job::connect())?;
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        TcpSocket::read(self, buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        TcpSocket::write(self, buf)
    }

    fn close(&self) {
        TcpSocket::close(self)
    }

    fn state(&self) -> SocketState {
        TcpSocket::state(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpSocket::peer_addr(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpSocket::local_addr(self)
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}
