//! Readiness multiplexer.
//!
//! A single thread owns the [`mio::Poll`] instance, waits for readiness on
//! every registered socket and runs the socket's current [`Job`]. All socket
//! I/O of the transport happens on that thread. Jobs are registered and
//! removed through a [`MultiplexerHandle`] from any thread.
//!
//! mio reports readiness edge-triggered. After every job invocation that keeps
//! a registration the socket is re-armed, which makes the OS report readiness
//! that is still pending again. Jobs can therefore make one step of progress
//! per cycle without losing wakeups.

mod job;
mod table;

pub use job::{Job, JobResult, JobTarget, Readiness, Step};

use crate::config::TransportConfig;
use crate::error::Error;
use crate::events::SocketId;
use mio::{Events, Poll, Registry, Token, Waker};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use table::JobTable;
use tracing::{debug, error, info, instrument, trace, warn};

// Internal constants for registration tokens
const WAKE_ID: usize = 2;
const SOCKET_ID_RANGE_START: usize = 1000;

struct Shared {
    registry: Registry,
    waker: Waker,
    table: Mutex<JobTable>,
    running: AtomicBool,
    next_id: AtomicUsize,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Runs the job registered for `id` once.
    fn service(&self, id: SocketId, ready: Readiness) {
        let Some((target, job)) = self.table().begin(id) else {
            trace!(id, "Readiness without an idle job");
            return;
        };

        trace!(id, ?job, ?ready, "Running job");
        let result = match target.run_job(&job, ready) {
            Ok(result) => result,
            Err(err) => {
                if err.is_fatal() {
                    debug!(id, ?job, %err, "Job failed");
                } else {
                    warn!(id, ?job, %err, "Job hit a socket in the wrong state");
                }
                target.job_failed(err);
                JobResult::Done
            }
        };

        let next = self.table().finish(id, job, result);
        if let Some(next) = next {
            match target.arm(&self.registry, next.interest()) {
                Ok(true) => {}
                Ok(false) => {
                    self.table().remove(id);
                }
                Err(err) => {
                    warn!(id, ?err, "Failed to re-arm socket");
                    self.table().remove(id);
                    target.job_failed(err.into());
                }
            }
        }
    }
}

/// Thread-safe handle for registering jobs with a [`Multiplexer`].
#[derive(Clone)]
pub struct MultiplexerHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MultiplexerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerHandle")
            .field("running", &self.is_running())
            .field("jobs", &self.job_count())
            .finish()
    }
}

impl MultiplexerHandle {
    /// Registers `job` for `target`, replacing any job it had.
    ///
    /// The socket becomes eligible for the next poll cycle.
    ///
    /// # Errors
    ///
    /// - [`Error::SocketClosed`] if the socket has no open handle.
    /// - [`Error::MultiplexerStopped`] if the poll loop has ended.
    #[instrument(skip(self, target), fields(id = target.id()))]
    pub fn add_job(&self, target: Arc<dyn JobTarget>, job: Job) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::MultiplexerStopped);
        }

        let id = target.id();
        self.shared
            .table()
            .insert(id, Arc::downgrade(&target), job);

        // Registered before arming so a readiness event cannot arrive for a
        // socket without a job.
        match target.arm(&self.shared.registry, job.interest()) {
            Ok(true) => {}
            Ok(false) => {
                self.shared.table().remove(id);
                return Err(Error::SocketClosed { id });
            }
            Err(err) => {
                self.shared.table().remove(id);
                return Err(err.into());
            }
        }

        debug!(?job, "Job added");
        self.shared.waker.wake()?;
        Ok(())
    }

    /// Deregisters the job for `id`. Removing an absent job is a no-op.
    ///
    /// After this returns the job is not started again. A job that is
    /// running right now finishes, but its result is discarded.
    pub fn remove_job(&self, id: SocketId) -> bool {
        let removed = self.shared.table().remove(id);
        if removed {
            debug!(id, "Job removed");
        }
        removed
    }

    /// The job a socket will run on its next readiness, if any.
    pub fn registered_job(&self, id: SocketId) -> Option<Job> {
        self.shared.table().registered(id)
    }

    /// Number of sockets that have a job registered.
    pub fn job_count(&self) -> usize {
        self.shared.table().len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Allocates an identifier for a new socket.
    pub fn next_socket_id(&self) -> SocketId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }
}

/// Owns the poll thread. Dropping it stops the thread.
pub struct Multiplexer {
    handle: MultiplexerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Creates the poll instance and starts the poll thread.
    pub fn new(config: &TransportConfig) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), Token(WAKE_ID))?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            table: Mutex::new(JobTable::default()),
            running: AtomicBool::new(true),
            next_id: AtomicUsize::new(SOCKET_ID_RANGE_START),
        });

        let poll_timeout = config.poll_timeout;
        let poll_capacity = config.poll_capacity;
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("kvmlink-multiplexer".to_string())
            .spawn(move || run_poll_loop(thread_shared, poll, poll_capacity, poll_timeout))?;

        info!(?poll_timeout, poll_capacity, "Multiplexer started");
        Ok(Self {
            handle: MultiplexerHandle { shared },
            thread: Some(thread),
        })
    }

    /// A cloneable handle for sockets and other threads.
    pub fn handle(&self) -> MultiplexerHandle {
        self.handle.clone()
    }

    /// Stops the poll thread and waits for it. Idempotent.
    ///
    /// Sockets that still have jobs are not closed, but nothing services them
    /// any more.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.shared.running.store(false, Ordering::Release);
        if let Err(err) = self.handle.shared.waker.wake() {
            warn!(?err, "Failed to wake poll loop for shutdown");
        }
        if thread.join().is_err() {
            error!("Poll thread panicked");
        }
        self.handle.shared.table().clear();
        info!("Multiplexer stopped");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_poll_loop(shared: Arc<Shared>, mut poll: Poll, capacity: usize, timeout: Duration) {
    let mut events = Events::with_capacity(capacity);

    while shared.running.load(Ordering::Acquire) {
        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!(?err, "Poll failed, stopping multiplexer");
            break;
        }

        for event in events.iter() {
            let Token(id) = event.token();
            if id == WAKE_ID {
                // Registration changes or shutdown; nothing to run
                continue;
            }
            shared.service(id, Readiness::from(event));
        }
    }

    shared.running.store(false, Ordering::Release);
    debug!("Poll loop exited");
}
