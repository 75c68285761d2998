//! Listening socket that hands accepted streams to the socket factory.

use super::DataSocket;
use crate::address::NetworkAddress;
use crate::error::Error;
use crate::events::{EventQueue, SocketId, TransportEvent};
use crate::factory::SocketFactory;
use crate::multiplexer::{Job, JobResult, JobTarget, Readiness, Step};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, instrument, warn};

struct ListenState {
    listener: Option<TcpListener>,
    registered: bool,
    local_addr: Option<SocketAddr>,
    pending: VecDeque<(TcpStream, SocketAddr)>,
    failed: bool,
}

/// Accepts incoming connections and hands them out as sockets.
///
/// Each accepted connection is announced with an `Incoming` event and picked
/// up with [`TcpListenSocket::accept`]. With TLS enabled the returned socket
/// has its server handshake already started.
pub struct TcpListenSocket {
    id: SocketId,
    me: Weak<TcpListenSocket>,
    factory: SocketFactory,
    events: EventQueue,
    inner: Mutex<ListenState>,
}

impl fmt::Debug for TcpListenSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListenSocket")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl TcpListenSocket {
    pub(crate) fn new(factory: SocketFactory, events: EventQueue) -> Arc<Self> {
        let id = factory.multiplexer().next_socket_id();
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            factory,
            events,
            inner: Mutex::new(ListenState {
                listener: None,
                registered: false,
                local_addr: None,
                pending: VecDeque::new(),
                failed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ListenState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// The bound address, with the actual port when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().local_addr
    }

    /// Binds to `address` and starts accepting.
    #[instrument(skip(self), fields(id = self.id))]
    pub fn bind(&self, address: &NetworkAddress) -> Result<SocketAddr, Error> {
        let target = address.resolve()?;
        let local_addr = {
            let mut inner = self.lock();
            if inner.listener.is_some() {
                return Err(Error::InvalidState {
                    id: self.id,
                    operation: "bind",
                    state: "listening".to_string(),
                });
            }
            let listener = TcpListener::bind(target)?;
            let local_addr = listener.local_addr()?;
            inner.listener = Some(listener);
            inner.local_addr = Some(local_addr);
            local_addr
        };

        let me = self.me.upgrade().ok_or(Error::SocketClosed { id: self.id })?;
        self.factory.multiplexer().add_job(me, Job::accept())?;
        info!(%local_addr, "Listening");
        Ok(local_addr)
    }

    /// Takes the next accepted connection, if any.
    pub fn accept(&self) -> Result<Option<Arc<dyn DataSocket>>, Error> {
        let Some((stream, peer)) = self.lock().pending.pop_front() else {
            return Ok(None);
        };
        self.factory.wrap_accepted(stream, peer).map(Some)
    }

    /// Number of accepted connections waiting in [`TcpListenSocket::accept`].
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Stops listening. Queued connections are dropped. Idempotent.
    pub fn close(&self) {
        self.factory.multiplexer().remove_job(self.id);

        let mut inner = self.lock();
        let inner = &mut *inner;
        if let Some(mut listener) = inner.listener.take() {
            if inner.registered {
                if let Err(err) = self.factory.multiplexer().registry().deregister(&mut listener) {
                    debug!(id = self.id, ?err, "Deregister failed");
                }
            }
            inner.registered = false;
            inner.pending.clear();
            info!(id = self.id, "Listener closed");
        }
    }

    fn accept_step(&self) -> Result<JobResult, Error> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(listener) = inner.listener.as_ref() else {
            return Ok(JobResult::Done);
        };

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(id = self.id, %peer, "Connection waiting");
                inner.pending.push_back((stream, peer));
                self.events.post(TransportEvent::Incoming { id: self.id });
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            // The peer gave up before we accepted; the listener is fine
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::Interrupted
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionReset
                ) =>
            {
                debug!(id = self.id, ?err, "Transient accept error");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(JobResult::Continue)
    }
}

impl JobTarget for TcpListenSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn run_job(&self, job: &Job, _ready: Readiness) -> Result<JobResult, Error> {
        match job.step() {
            Step::Accept => self.accept_step(),
            step => {
                warn!(id = self.id, ?step, "Unexpected job for listener");
                Ok(JobResult::Done)
            }
        }
    }

    fn job_failed(&self, err: Error) {
        let first = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.failed, true)
        };
        if first {
            error!(id = self.id, %err, "Listener failed");
            self.events.post(TransportEvent::Failed {
                id: self.id,
                reason: err.to_string(),
            });
        }
        self.close();
    }

    fn arm(&self, registry: &Registry, interest: Interest) -> io::Result<bool> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(listener) = inner.listener.as_mut() else {
            return Ok(false);
        };
        if inner.registered {
            registry.reregister(listener, Token(self.id), interest)?;
        } else {
            registry.register(listener, Token(self.id), interest)?;
            inner.registered = true;
        }
        Ok(true)
    }
}

impl Drop for TcpListenSocket {
    fn drop(&mut self) {
        self.close();
    }
}
