use crate::events::{EventQueue, SocketId, TransportEvent};
use tracing::debug;

/// Per-socket gate in front of the event queue.
///
/// Lives inside the socket's state lock, so events leave in transition order.
/// Once a terminal event went out nothing else does, and `Connected` or
/// `SecureConnected` is posted at most once.
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    connected: bool,
    secure: bool,
    terminated: bool,
}

impl Lifecycle {
    /// Posts `event` unless the lifecycle rules suppress it. Returns whether
    /// it was posted.
    pub fn post(&mut self, events: &EventQueue, event: TransportEvent) -> bool {
        if self.terminated {
            debug!(?event, "Suppressing event after terminal event");
            return false;
        }
        match &event {
            TransportEvent::Connected { .. } if self.connected => return false,
            TransportEvent::Connected { .. } => self.connected = true,
            TransportEvent::SecureConnected { .. } if self.secure => return false,
            TransportEvent::SecureConnected { .. } => self.secure = true,
            TransportEvent::Disconnected { .. } | TransportEvent::Failed { .. } => {
                self.terminated = true
            }
            _ => {}
        }
        events.post(event);
        true
    }

    pub fn failed(&mut self, events: &EventQueue, id: SocketId, reason: String) -> bool {
        self.post(events, TransportEvent::Failed { id, reason })
    }
}
