//! Multiplexer Integration Tests
//!
//! Drives the poll loop with a minimal job target wrapped around a mio
//! listener, independent of the socket types.
//!
//! Use TEST_LOG=1/2/3 for info/debug/trace output:
//!
//! ```bash
//! TEST_LOG=2 cargo test --test multiplexer -- --nocapture
//! ```

use kvmlink::{Error, Job, JobResult, JobTarget, Multiplexer, Readiness, SocketId, Step, TransportConfig};
use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

/// Initialize tracing based on TEST_LOG environment variable
fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace",
                };

                let filter = format!("kvmlink={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Test Target
// ============================================================================

/// Accepts connections, counting job invocations and failures.
struct AcceptTarget {
    id: SocketId,
    listener: Mutex<Option<TcpListener>>,
    runs: AtomicUsize,
    accepted: AtomicUsize,
    failures: Mutex<Vec<String>>,
    fail_next: bool,
}

impl AcceptTarget {
    fn bind(id: SocketId, fail_next: bool) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        Arc::new(Self {
            id,
            listener: Mutex::new(Some(listener)),
            runs: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
            fail_next,
        })
    }

    fn local_addr(&self) -> std::net::SocketAddr {
        self.listener
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .local_addr()
            .unwrap()
    }
}

impl JobTarget for AcceptTarget {
    fn id(&self) -> SocketId {
        self.id
    }

    fn run_job(&self, job: &Job, ready: Readiness) -> Result<JobResult, Error> {
        assert_eq!(job.step(), Step::Accept);
        assert!(ready.readable);
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail_next {
            return Err(Error::PeerClosed);
        }

        let guard = self.listener.lock().unwrap();
        match guard.as_ref().unwrap().accept() {
            Ok(_) => {
                self.accepted.fetch_add(1, Ordering::SeqCst);
                Ok(JobResult::Done)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(JobResult::Continue),
            Err(err) => Err(err.into()),
        }
    }

    fn job_failed(&self, err: Error) {
        self.failures.lock().unwrap().push(err.to_string());
    }

    fn arm(&self, registry: &Registry, interest: Interest) -> io::Result<bool> {
        let mut guard = self.listener.lock().unwrap();
        let Some(listener) = guard.as_mut() else {
            return Ok(false);
        };
        // Registering twice fails, so fall back to reregister
        match registry.register(listener, Token(self.id), interest) {
            Ok(()) => Ok(true),
            Err(_) => registry.reregister(listener, Token(self.id), interest).map(|_| true),
        }
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn runs_job_on_readiness_then_deregisters() {
    init_tracing();
    let mux = Multiplexer::new(&TransportConfig::default()).unwrap();
    let handle = mux.handle();
    let target = AcceptTarget::bind(handle.next_socket_id(), false);

    handle.add_job(target.clone(), Job::accept()).unwrap();
    assert_eq!(handle.registered_job(target.id), Some(Job::accept()));
    assert_eq!(target.runs.load(Ordering::SeqCst), 0);

    let _client = std::net::TcpStream::connect(target.local_addr()).unwrap();
    wait_until(|| target.accepted.load(Ordering::SeqCst) == 1);
    wait_until(|| handle.job_count() == 0);
    assert_eq!(handle.registered_job(target.id), None);
    assert!(target.failures.lock().unwrap().is_empty());
}

#[test]
fn failing_job_is_reported_once_and_removed() {
    init_tracing();
    let mux = Multiplexer::new(&TransportConfig::default()).unwrap();
    let handle = mux.handle();
    let target = AcceptTarget::bind(handle.next_socket_id(), true);

    handle.add_job(target.clone(), Job::accept()).unwrap();
    let _client = std::net::TcpStream::connect(target.local_addr()).unwrap();

    wait_until(|| !target.failures.lock().unwrap().is_empty());
    wait_until(|| handle.job_count() == 0);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(target.runs.load(Ordering::SeqCst), 1);
    assert_eq!(target.failures.lock().unwrap().len(), 1);
}

#[test]
fn remove_job_is_idempotent() {
    init_tracing();
    let mux = Multiplexer::new(&TransportConfig::default()).unwrap();
    let handle = mux.handle();
    let target = AcceptTarget::bind(handle.next_socket_id(), false);

    handle.add_job(target.clone(), Job::accept()).unwrap();
    assert_eq!(handle.job_count(), 1);
    assert!(handle.remove_job(target.id));
    assert!(!handle.remove_job(target.id));
    assert_eq!(handle.job_count(), 0);

    // A removed job is not started again
    let _client = std::net::TcpStream::connect(target.local_addr()).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(target.runs.load(Ordering::SeqCst), 0);
}

#[test]
fn socket_ids_are_unique() {
    let mux = Multiplexer::new(&TransportConfig::default()).unwrap();
    let handle = mux.handle();
    let first = handle.next_socket_id();
    let second = handle.next_socket_id();
    assert_ne!(first, second);
}

#[test]
fn add_job_after_shutdown_fails() {
    init_tracing();
    let mut mux = Multiplexer::new(&TransportConfig::default()).unwrap();
    let handle = mux.handle();
    assert!(handle.is_running());

    mux.shutdown();
    mux.shutdown();
    assert!(!handle.is_running());

    let target = AcceptTarget::bind(handle.next_socket_id(), false);
    let err = handle.add_job(target, Job::accept()).unwrap_err();
    assert!(matches!(err, Error::MultiplexerStopped));
}

#[test]
fn target_without_handle_is_rejected() {
    let mux = Multiplexer::new(&TransportConfig::default()).unwrap();
    let handle = mux.handle();
    let target = AcceptTarget::bind(handle.next_socket_id(), false);
    target.listener.lock().unwrap().take();

    let err = handle.add_job(target.clone(), Job::accept()).unwrap_err();
    assert!(matches!(err, Error::SocketClosed { .. }));
    assert_eq!(handle.job_count(), 0);
}
