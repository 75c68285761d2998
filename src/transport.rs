//! Convenience front end bundling a multiplexer, an event queue and a socket
//! factory.

use crate::address::NetworkAddress;
use crate::config::TransportConfig;
use crate::error::Error;
use crate::events::{event_channel, EventReceiver, SocketId, TransportEvent};
use crate::factory::SocketFactory;
use crate::multiplexer::{Multiplexer, MultiplexerHandle};
use crate::secure::{Fingerprint, TlsContext};
use crate::socket::{DataSocket, TcpListenSocket};
use config::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Owns the poll thread and keeps track of the sockets created through it.
///
/// Sockets stay registered until [`Transport::close`] is called for them,
/// even after a `Disconnected` or `Failed` event, so remaining input can
/// still be read.
///
/// # Configuration Keys
///
/// See [`TransportConfig::from_config_named`]. The most relevant are
/// `tls_enabled`, `tls_cert`, `tls_key`, `trust_store` and `trust_policy`.
///
/// # Example
///
/// ```toml
/// tls_enabled = true
/// tls_cert = "/etc/kvmlink/cert.pem"
/// tls_key = "/etc/kvmlink/key.pem"
///
/// [server]
/// trust_policy = "confirm"
/// ```
pub struct Transport {
    factory: SocketFactory,
    receiver: EventReceiver,
    sockets: HashMap<SocketId, Arc<dyn DataSocket>>,
    listeners: HashMap<SocketId, Arc<TcpListenSocket>>,
    // Declared last: sockets close before the poll thread stops
    multiplexer: Multiplexer,
}

// ============================================================================
// Constructors
// ============================================================================

impl Transport {
    /// Creates a transport from `config`.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a transport, preferring configuration keys under `name`.
    ///
    /// Configuration lookup follows this priority:
    /// 1. `{name}.{key}` (e.g., `server.tls_enabled`)
    /// 2. `{key}` (e.g., `tls_enabled`)
    /// 3. The built-in default
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        Self::with_config(TransportConfig::from_config_named(config, name)?)
    }

    pub fn with_config(config: TransportConfig) -> Result<Self, Error> {
        let multiplexer = Multiplexer::new(&config)?;
        let (events, receiver) = event_channel();
        let factory = SocketFactory::new(multiplexer.handle(), events, config)?;
        Ok(Self::assemble(multiplexer, receiver, factory))
    }

    /// Creates a secure transport around a prepared TLS context, ignoring
    /// the TLS settings in `config`.
    pub fn with_tls_context(config: TransportConfig, context: Arc<TlsContext>) -> Result<Self, Error> {
        let multiplexer = Multiplexer::new(&config)?;
        let (events, receiver) = event_channel();
        let factory =
            SocketFactory::with_tls_context(multiplexer.handle(), events, config, context);
        Ok(Self::assemble(multiplexer, receiver, factory))
    }

    fn assemble(multiplexer: Multiplexer, receiver: EventReceiver, factory: SocketFactory) -> Self {
        Self {
            factory,
            receiver,
            sockets: HashMap::new(),
            listeners: HashMap::new(),
            multiplexer,
        }
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl Transport {
    /// Starts connecting to `address`. Progress is reported as events for the
    /// returned socket's id.
    #[instrument(skip(self))]
    pub fn connect(&mut self, address: &NetworkAddress) -> Result<Arc<dyn DataSocket>, Error> {
        let socket = self.factory.create();
        socket.connect(address)?;
        self.sockets.insert(socket.id(), socket.clone());
        Ok(socket)
    }

    /// Listens on `address`. Returns the listener id and the bound address.
    #[instrument(skip(self))]
    pub fn listen(&mut self, address: &NetworkAddress) -> Result<(SocketId, SocketAddr), Error> {
        let listener = self.factory.create_listener();
        let local_addr = listener.bind(address)?;
        let id = listener.id();
        self.listeners.insert(id, listener);
        Ok((id, local_addr))
    }

    /// Takes every connection waiting on `listener`.
    pub fn accept(&mut self, listener: SocketId) -> Result<Vec<Arc<dyn DataSocket>>, Error> {
        let Some(listener) = self.listeners.get(&listener).cloned() else {
            return Err(Error::SocketClosed { id: listener });
        };
        let mut accepted = Vec::new();
        while let Some(socket) = listener.accept()? {
            debug!(listener = listener.id(), id = socket.id(), "Accepted socket");
            self.sockets.insert(socket.id(), socket.clone());
            accepted.push(socket);
        }
        Ok(accepted)
    }

    pub fn socket(&self, id: SocketId) -> Option<&Arc<dyn DataSocket>> {
        self.sockets.get(&id)
    }

    pub fn listener(&self, id: SocketId) -> Option<&Arc<TcpListenSocket>> {
        self.listeners.get(&id)
    }

    pub fn listener_addresses(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|listener| listener.local_addr())
            .collect()
    }

    /// Closes and forgets the socket or listener with `id`.
    pub fn close(&mut self, id: SocketId) {
        if let Some(socket) = self.sockets.remove(&id) {
            socket.close();
        }
        if let Some(listener) = self.listeners.remove(&id) {
            listener.close();
        }
    }

    pub fn close_all(&mut self) {
        for (_, socket) in self.sockets.drain() {
            socket.close();
        }
        for (_, listener) in self.listeners.drain() {
            listener.close();
        }
    }
}

// ============================================================================
// Events and Utilities
// ============================================================================

impl Transport {
    /// Waits up to `timeout` for events; `None` waits indefinitely.
    pub fn fetch_events(&self, timeout: Option<Duration>) -> Vec<TransportEvent> {
        self.receiver.fetch_events(timeout)
    }

    pub fn try_fetch_events(&self) -> Vec<TransportEvent> {
        self.receiver.try_fetch_events()
    }

    pub fn factory(&self) -> &SocketFactory {
        &self.factory
    }

    pub fn multiplexer(&self) -> MultiplexerHandle {
        self.multiplexer.handle()
    }

    /// Fingerprint this host presents to peers, if TLS is enabled.
    pub fn local_fingerprint(&self) -> Option<Fingerprint> {
        self.factory
            .tls_context()
            .map(|context| context.local_fingerprint())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close_all();
        self.multiplexer.shutdown();
    }
}
