//! Lifecycle notifications from sockets to the application.
//!
//! Sockets post [`TransportEvent`]s onto an [`EventQueue`] from the poll loop
//! (or from whichever thread closes them). The application drains them with
//! an [`EventReceiver`] on its own schedule.

use crate::secure::Fingerprint;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use tracing::{trace, warn};

/// Identifier of a socket or listener, unique within one multiplexer.
pub type SocketId = usize;

/// Events produced by sockets and listeners.
///
/// For a given socket, events arrive in the order the transitions happened.
/// [`TransportEvent::Failed`] and [`TransportEvent::Disconnected`] are
/// terminal: nothing follows them for that socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A non-blocking connect was started.
    Connecting { id: SocketId },
    /// The byte stream is established (plaintext).
    Connected { id: SocketId },
    /// The TLS handshake completed and the peer passed the trust check.
    SecureConnected {
        id: SocketId,
        fingerprint: Fingerprint,
    },
    /// New bytes can be read from the socket.
    InputReady { id: SocketId },
    /// A previously partial write can be resubmitted.
    OutputReady { id: SocketId },
    /// A listener has a connection waiting in `accept()`.
    Incoming { id: SocketId },
    /// The connection ended normally.
    Disconnected { id: SocketId },
    /// The connection failed. Contains a human-readable reason.
    Failed { id: SocketId, reason: String },
}

impl TransportEvent {
    /// The socket the event is about.
    pub fn id(&self) -> SocketId {
        match self {
            TransportEvent::Connecting { id }
            | TransportEvent::Connected { id }
            | TransportEvent::SecureConnected { id, .. }
            | TransportEvent::InputReady { id }
            | TransportEvent::OutputReady { id }
            | TransportEvent::Incoming { id }
            | TransportEvent::Disconnected { id }
            | TransportEvent::Failed { id, .. } => *id,
        }
    }

    /// Whether no further events follow for this socket.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportEvent::Disconnected { .. } | TransportEvent::Failed { .. }
        )
    }
}

/// Creates a connected queue/receiver pair.
pub fn event_channel() -> (EventQueue, EventReceiver) {
    let (sender, receiver) = channel();
    (EventQueue { sender }, EventReceiver { receiver })
}

/// Thread-safe, non-blocking posting side. Clone it freely.
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: Sender<TransportEvent>,
}

impl EventQueue {
    /// Posts an event. Never blocks.
    ///
    /// If the receiver is gone the event is dropped; the transport keeps
    /// running so sockets can still be closed cleanly.
    pub fn post(&self, event: TransportEvent) {
        trace!(?event, "Posting event");
        if let Err(err) = self.sender.send(event) {
            warn!(event = ?err.0, "Event receiver dropped, discarding event");
        }
    }
}

/// Draining side of the event channel.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: Receiver<TransportEvent>,
}

impl EventReceiver {
    /// Returns all queued events without blocking.
    pub fn try_fetch_events(&self) -> Vec<TransportEvent> {
        self.receiver.try_iter().collect()
    }

    /// Blocks until at least one event is queued or `timeout` elapses, then
    /// returns everything queued. `None` waits indefinitely.
    ///
    /// Returns an empty vector on timeout or when every [`EventQueue`] has
    /// been dropped.
    pub fn fetch_events(&self, timeout: Option<Duration>) -> Vec<TransportEvent> {
        let first = match timeout {
            Some(timeout) => match self.receiver.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Vec::new()
                }
            },
            None => match self.receiver.recv() {
                Ok(event) => event,
                Err(_) => return Vec::new(),
            },
        };

        let mut events = vec![first];
        events.extend(self.receiver.try_iter());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_keep_post_order() {
        let (queue, receiver) = event_channel();
        queue.post(TransportEvent::Connecting { id: 7 });
        queue.post(TransportEvent::Connected { id: 7 });
        queue.post(TransportEvent::Disconnected { id: 7 });

        let events = receiver.fetch_events(Some(Duration::from_millis(10)));
        assert_eq!(
            events,
            vec![
                TransportEvent::Connecting { id: 7 },
                TransportEvent::Connected { id: 7 },
                TransportEvent::Disconnected { id: 7 },
            ]
        );
        assert!(events[2].is_terminal());
    }

    #[test]
    fn fetch_times_out_empty() {
        let (_queue, receiver) = event_channel();
        assert!(receiver
            .fetch_events(Some(Duration::from_millis(5)))
            .is_empty());
        assert!(receiver.try_fetch_events().is_empty());
    }

    #[test]
    fn posting_from_other_threads() {
        let (queue, receiver) = event_channel();
        let handles: Vec<_> = (0..4)
            .map(|id| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.post(TransportEvent::InputReady { id }))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut ids: Vec<_> = receiver.try_fetch_events().iter().map(|e| e.id()).collect();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn post_without_receiver_does_not_panic() {
        let (queue, receiver) = event_channel();
        drop(receiver);
        queue.post(TransportEvent::Connected { id: 1 });
    }
}
