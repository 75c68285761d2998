//! The unit of work the multiplexer runs for a socket.

use crate::error::Error;
use crate::events::SocketId;
use mio::event::Event;
use mio::{Interest, Registry};
use std::io;

/// What a job does when its socket becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Complete a non-blocking connect.
    Connect,
    /// Move bytes between the OS socket and the socket's buffers.
    Transfer,
    /// Advance the TLS handshake by one read or one write.
    Handshake,
    /// Accept one pending connection on a listener.
    Accept,
}

/// A step bound to the readiness it waits for.
///
/// The socket a job belongs to is fixed by its registration, so a job is a
/// plain value and a state transition is just returning a different one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    step: Step,
    interest: Interest,
}

impl Job {
    pub fn new(step: Step, interest: Interest) -> Self {
        Self { step, interest }
    }

    pub fn connect() -> Self {
        Self::new(Step::Connect, Interest::WRITABLE)
    }

    pub fn transfer(interest: Interest) -> Self {
        Self::new(Step::Transfer, interest)
    }

    pub fn handshake_read() -> Self {
        Self::new(Step::Handshake, Interest::READABLE)
    }

    pub fn handshake_write() -> Self {
        Self::new(Step::Handshake, Interest::WRITABLE)
    }

    pub fn accept() -> Self {
        Self::new(Step::Accept, Interest::READABLE)
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// `Continue` if `next` is this job, otherwise `Transition(next)`.
    pub fn yield_to(&self, next: Job) -> JobResult {
        if *self == next {
            JobResult::Continue
        } else {
            JobResult::Transition(next)
        }
    }
}

/// Outcome of one job invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    /// Keep the same job registered.
    Continue,
    /// Replace the job.
    Transition(Job),
    /// Deregister; the socket has nothing more to wait for.
    Done,
}

/// Readiness reported by the OS for one socket in one poll cycle.
///
/// Error and hang-up conditions are folded into both directions so the next
/// read or write attempt surfaces the actual failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
    };
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

/// A socket the multiplexer can drive.
///
/// Implementations must not call
/// [`MultiplexerHandle::add_job`](super::MultiplexerHandle::add_job) while
/// holding a lock that [`JobTarget::arm`] takes.
pub trait JobTarget: Send + Sync {
    fn id(&self) -> SocketId;

    /// Performs one step. Must not block and must make at most one system
    /// call's worth of progress.
    fn run_job(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error>;

    /// Called when [`JobTarget::run_job`] returned an error. The socket moves
    /// to its terminal failed state and reports the failure once.
    fn job_failed(&self, err: Error);

    /// Registers or re-registers the OS handle with `interest`.
    ///
    /// Returns `Ok(false)` when the socket no longer has a handle.
    fn arm(&self, registry: &Registry, interest: Interest) -> io::Result<bool>;
}
